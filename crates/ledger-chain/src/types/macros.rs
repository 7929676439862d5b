/// Implements flat RLP field encoding for a struct whose fields are all
/// `Encodable + Decodable`.
///
/// Generates `fields_len`, `encode_fields` and `decode_fields`, which the
/// envelope code wraps in a list header together with signatures.
macro_rules! impl_rlp_fields {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl $ty {
            pub(crate) fn fields_len(&self) -> usize {
                0 $(+ alloy_rlp::Encodable::length(&self.$field))+
            }

            pub(crate) fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
                $(alloy_rlp::Encodable::encode(&self.$field, out);)+
            }

            pub(crate) fn decode_fields(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
                Ok(Self {
                    $($field: alloy_rlp::Decodable::decode(buf)?,)+
                })
            }
        }
    };
}

pub(crate) use impl_rlp_fields;
