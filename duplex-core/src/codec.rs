//! # Adaptive Protobuf Codec
//!
//! A single, stateless codec shared by the Connect and gRPC stacks.
//!
//! ## How it works
//!
//! Every message type implements [`WireMessage`], which may advertise two capabilities:
//!
//! 1. **Fast path** ([`FastPath`]): compiled, type-specific encode/decode routines
//!    (the ones `prost` derives for generated messages).
//! 2. **Schema** ([`Schema`]): a `prost_reflect::MessageDescriptor` plus a way to move the
//!    value in and out of a `DynamicMessage`. The generic path serializes through the
//!    descriptor, so it works for any type that can describe itself.
//!
//! The choice is made when a message is marshaled or unmarshaled: the fast path wins when
//! present, the schema is used otherwise, and a type exposing neither fails with
//! [`CodecError::UnsupportedMessageType`]. The probe runs once per concrete type and its
//! result is cached.
//!
//! Both paths emit standard Protobuf binary, so the same logical message produces the same
//! bytes no matter which protocol asked for it.
mod capability;
mod tonic_codec;

pub use capability::{FastPath, Schema, WireMessage};
pub use tonic_codec::{AdaptiveCodec, AdaptiveDecoder, AdaptiveEncoder};

use crate::BoxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use capability::Strategy;
use prost::Message;
use prost_reflect::DynamicMessage;

/// Negotiation name advertised by the codec, used to build protocol content types.
pub const CODEC_NAME: &str = "proto";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to marshal or unmarshal, message is '{type_name}', want a fast path or a schema")]
    UnsupportedMessageType { type_name: &'static str },
    #[error("Failed to decode Protobuf bytes into '{type_name}': '{source}'")]
    Decode {
        type_name: &'static str,
        #[source]
        source: prost::DecodeError,
    },
    #[error("'{type_name}' does not match the schema of '{message}': '{source}'")]
    Schema {
        type_name: &'static str,
        message: String,
        #[source]
        source: BoxError,
    },
}

impl From<CodecError> for tonic::Status {
    fn from(err: CodecError) -> Self {
        tonic::Status::internal(err.to_string())
    }
}

/// The adaptive codec.
///
/// It carries no state: every value is interchangeable and safe to share between any number
/// of concurrent calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// The negotiation name, `"proto"`. It does not depend on the message type.
    pub fn name(&self) -> &'static str {
        CODEC_NAME
    }

    /// Serializes `message` into a fresh buffer.
    ///
    /// Nothing is produced when the type is unsupported or does not match its schema.
    pub fn marshal<T: WireMessage>(&self, message: &T) -> Result<Bytes, CodecError> {
        let mut buf = match Strategy::<T>::resolve()? {
            Strategy::Fast(fast) => BytesMut::with_capacity(fast.encoded_len(message)),
            Strategy::Reflective(_) => BytesMut::new(),
        };
        self.encode_into(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserializes a `T` from `bytes`.
    pub fn unmarshal<T: WireMessage>(&self, mut bytes: impl Buf) -> Result<T, CodecError> {
        self.decode_from(&mut bytes)
    }

    pub(crate) fn encode_into<T: WireMessage>(
        &self,
        message: &T,
        mut dst: &mut dyn BufMut,
    ) -> Result<(), CodecError> {
        match Strategy::<T>::resolve()? {
            Strategy::Fast(fast) => {
                fast.encode(message, dst);
                Ok(())
            }
            Strategy::Reflective(schema) => {
                // The dynamic message is fully built before anything is written.
                let dynamic = schema.to_dynamic(message)?;
                dynamic.encode_raw(&mut dst);
                Ok(())
            }
        }
    }

    pub(crate) fn decode_from<T: WireMessage>(&self, src: &mut dyn Buf) -> Result<T, CodecError> {
        let type_name = std::any::type_name::<T>();

        match Strategy::<T>::resolve()? {
            Strategy::Fast(fast) => fast
                .decode(src)
                .map_err(|source| CodecError::Decode { type_name, source }),
            Strategy::Reflective(schema) => {
                let dynamic = DynamicMessage::decode(schema.descriptor().clone(), src)
                    .map_err(|source| CodecError::Decode { type_name, source })?;
                schema.from_dynamic(&dynamic)
            }
        }
    }
}

/// Checks that `T` can go through the codec, without encoding anything.
///
/// Clients use it to reject unsupported types before a call reaches the wire.
pub fn probe<T: WireMessage>() -> Result<(), CodecError> {
    Strategy::<T>::resolve().map(|_| ())
}

/// Name of the serialization path the codec picks for `T`, for diagnostics.
pub fn path_name<T: WireMessage>() -> Result<&'static str, CodecError> {
    Strategy::<T>::resolve().map(|strategy| match strategy {
        Strategy::Fast(_) => "fast",
        Strategy::Reflective(_) => "reflective",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::{DescriptorPool, MessageDescriptor, ReflectMessage};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
        field_descriptor_proto::{Label, Type},
    };
    use std::sync::LazyLock;

    static POOL: LazyLock<DescriptorPool> = LazyLock::new(|| {
        let file = FileDescriptorProto {
            name: Some("codec_test.proto".to_string()),
            package: Some("codec.test".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Note".to_string()),
                field: vec![
                    FieldDescriptorProto {
                        name: Some("title".to_string()),
                        number: Some(1),
                        label: Some(Label::Optional as i32),
                        r#type: Some(Type::String as i32),
                        json_name: Some("title".to_string()),
                        ..Default::default()
                    },
                    FieldDescriptorProto {
                        name: Some("tags".to_string()),
                        number: Some(2),
                        label: Some(Label::Repeated as i32),
                        r#type: Some(Type::String as i32),
                        json_name: Some("tags".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        DescriptorPool::from_file_descriptor_set(prost_types::FileDescriptorSet { file: vec![file] })
            .unwrap()
    });

    fn note_descriptor() -> MessageDescriptor {
        POOL.get_message_by_name("codec.test.Note").unwrap()
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct FastNote {
        #[prost(string, tag = "1")]
        title: String,
        #[prost(string, repeated, tag = "2")]
        tags: Vec<String>,
    }

    impl WireMessage for FastNote {
        fn fast_path() -> Option<FastPath<Self>> {
            Some(FastPath::prost())
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct ReflectedNote {
        #[prost(string, tag = "1")]
        title: String,
        #[prost(string, repeated, tag = "2")]
        tags: Vec<String>,
    }

    impl ReflectMessage for ReflectedNote {
        fn descriptor(&self) -> MessageDescriptor {
            note_descriptor()
        }
    }

    impl WireMessage for ReflectedNote {
        fn schema() -> Option<Schema<Self>> {
            Some(Schema::reflect())
        }
    }

    #[derive(Debug)]
    struct Opaque;

    impl WireMessage for Opaque {}

    fn fast_note() -> FastNote {
        FastNote {
            title: "groceries".to_string(),
            tags: vec!["home".to_string(), "weekly".to_string()],
        }
    }

    #[test]
    fn test_codec_name_is_proto() {
        assert_eq!(MessageCodec.name(), "proto");
    }

    #[test]
    fn test_fast_path_round_trip() {
        let codec = MessageCodec;
        let bytes = codec.marshal(&fast_note()).unwrap();
        let decoded: FastNote = codec.unmarshal(bytes).unwrap();

        assert_eq!(decoded, fast_note());
        assert_eq!(path_name::<FastNote>().unwrap(), "fast");
    }

    #[test]
    fn test_reflective_path_round_trip() {
        let codec = MessageCodec;
        let note = ReflectedNote {
            title: "groceries".to_string(),
            tags: vec!["home".to_string()],
        };

        let bytes = codec.marshal(&note).unwrap();
        let decoded: ReflectedNote = codec.unmarshal(bytes).unwrap();

        assert_eq!(decoded, note);
        assert_eq!(path_name::<ReflectedNote>().unwrap(), "reflective");
    }

    #[test]
    fn test_both_paths_agree_on_the_wire() {
        let codec = MessageCodec;
        let fast = codec.marshal(&fast_note()).unwrap();

        let reflected = codec
            .marshal(&ReflectedNote {
                title: "groceries".to_string(),
                tags: vec!["home".to_string(), "weekly".to_string()],
            })
            .unwrap();

        assert_eq!(fast, reflected);

        // And each side reads the other's bytes.
        let crossed: ReflectedNote = codec.unmarshal(fast).unwrap();
        assert_eq!(crossed.tags, vec!["home", "weekly"]);
    }

    #[test]
    fn test_unsupported_type_is_rejected() {
        let err = MessageCodec.marshal(&Opaque).unwrap_err();

        match err {
            CodecError::UnsupportedMessageType { type_name } => {
                assert!(type_name.ends_with("Opaque"), "got {type_name}")
            }
            other => panic!("Expected UnsupportedMessageType, got {other:?}"),
        }

        assert!(matches!(
            MessageCodec.unmarshal::<Opaque>(&b"\x0a\x01a"[..]),
            Err(CodecError::UnsupportedMessageType { .. })
        ));
        assert!(probe::<Opaque>().is_err());
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let err = MessageCodec
            .unmarshal::<FastNote>(&b"\x0a\xff\xff\xff"[..])
            .unwrap_err();

        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_codec_error_becomes_internal_status() {
        let status: tonic::Status = CodecError::UnsupportedMessageType { type_name: "Opaque" }.into();

        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("Opaque"));
    }
}
