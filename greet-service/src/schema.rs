//! # greet.v1 Schema
//!
//! The descriptor pool for `greet/v1/greet.proto`, and the codec capabilities of the
//! generated messages.
//!
//! The pool is assembled from `prost_types` descriptors that mirror the `.proto` file, so no
//! `protoc` run is needed to get at the schema at runtime.
use crate::pb::{GreetRequest, GreetResponse};
use duplex_core::codec::{FastPath, Schema, WireMessage};
use prost_reflect::{DescriptorPool, MessageDescriptor, ReflectMessage};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
    field_descriptor_proto::{Label, Type},
};
use std::sync::LazyLock;

pub const PACKAGE: &str = "greet.v1";
pub const GREET_REQUEST: &str = "greet.v1.GreetRequest";
pub const GREET_RESPONSE: &str = "greet.v1.GreetResponse";

static POOL: LazyLock<DescriptorPool> = LazyLock::new(|| {
    DescriptorPool::from_file_descriptor_set(file_descriptor_set())
        .expect("greet.v1 descriptors are valid")
});

/// The descriptor pool holding `greet.v1`.
pub fn descriptor_pool() -> &'static DescriptorPool {
    &POOL
}

/// `greet/v1/greet.proto` as a `FileDescriptorSet`.
pub fn file_descriptor_set() -> FileDescriptorSet {
    let string_field = |name: &str, label: Label| FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(1),
        label: Some(label as i32),
        r#type: Some(Type::String as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    };

    let file = FileDescriptorProto {
        name: Some("greet/v1/greet.proto".to_string()),
        package: Some(PACKAGE.to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            DescriptorProto {
                name: Some("GreetRequest".to_string()),
                field: vec![string_field("name", Label::Optional)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("GreetResponse".to_string()),
                field: vec![string_field("message", Label::Repeated)],
                ..Default::default()
            },
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("GreetService".to_string()),
            method: vec![MethodDescriptorProto {
                name: Some("Greet".to_string()),
                input_type: Some(format!(".{GREET_REQUEST}")),
                output_type: Some(format!(".{GREET_RESPONSE}")),
                client_streaming: Some(false),
                server_streaming: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    FileDescriptorSet { file: vec![file] }
}

fn message(full_name: &str) -> MessageDescriptor {
    POOL.get_message_by_name(full_name)
        .unwrap_or_else(|| panic!("'{full_name}' is part of the greet.v1 pool"))
}

impl ReflectMessage for GreetRequest {
    fn descriptor(&self) -> MessageDescriptor {
        message(GREET_REQUEST)
    }
}

impl ReflectMessage for GreetResponse {
    fn descriptor(&self) -> MessageDescriptor {
        message(GREET_RESPONSE)
    }
}

// Generated messages have both capabilities; the codec prefers the fast path.
impl WireMessage for GreetRequest {
    fn fast_path() -> Option<FastPath<Self>> {
        Some(FastPath::prost())
    }

    fn schema() -> Option<Schema<Self>> {
        Some(Schema::reflect())
    }
}

impl WireMessage for GreetResponse {
    fn fast_path() -> Option<FastPath<Self>> {
        Some(FastPath::prost())
    }

    fn schema() -> Option<Schema<Self>> {
        Some(Schema::reflect())
    }
}

/// Renders a message with the Protobuf JSON mapping.
pub fn to_json<T: ReflectMessage>(message: &T) -> serde_json::Value {
    serde_json::to_value(message.transcode_to_dynamic()).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Failed to render message as JSON");
        serde_json::Value::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::codec::{MessageCodec, path_name};
    use prost::Message;

    #[test]
    fn test_pool_matches_the_service() {
        let service = descriptor_pool()
            .get_service_by_name("greet.v1.GreetService")
            .unwrap();
        let greet = service.methods().next().unwrap();

        assert_eq!(greet.name(), "Greet");
        assert!(greet.is_server_streaming());
        assert!(!greet.is_client_streaming());
        assert_eq!(greet.input().full_name(), GREET_REQUEST);
        assert_eq!(greet.output().full_name(), GREET_RESPONSE);
    }

    #[test]
    fn test_generated_messages_take_the_fast_path() {
        assert_eq!(path_name::<GreetRequest>().unwrap(), "fast");
        assert_eq!(path_name::<GreetResponse>().unwrap(), "fast");
    }

    #[test]
    fn test_schema_describes_the_same_bytes() {
        let response = GreetResponse {
            message: vec!["greeting 1".to_string(), "greeting 2".to_string()],
        };

        let dynamic = response.transcode_to_dynamic();
        assert_eq!(dynamic.encode_to_vec(), response.encode_to_vec());

        let bytes = MessageCodec.marshal(&response).unwrap();
        assert_eq!(&bytes[..], &response.encode_to_vec()[..]);
    }

    #[test]
    fn test_json_rendering() {
        let response = GreetResponse {
            message: vec!["greeting 1".to_string()],
        };

        assert_eq!(
            to_json(&response),
            serde_json::json!({ "message": ["greeting 1"] })
        );
    }
}
