//! Serialization capabilities and the per-type strategy cache.
use super::CodecError;
use crate::BoxError;
use bytes::{Buf, BufMut};
use prost::{DecodeError, Message};
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage};
use serde::{Serialize, de::DeserializeOwned};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{LazyLock, PoisonError, RwLock};

/// A value that can travel through [`super::MessageCodec`].
///
/// Both capabilities are optional. Implementations override the ones they have:
///
/// ```rust
/// use duplex_core::codec::{FastPath, WireMessage};
///
/// #[derive(Clone, PartialEq, prost::Message)]
/// pub struct Ping {
///     #[prost(uint64, tag = "1")]
///     pub id: u64,
/// }
///
/// impl WireMessage for Ping {
///     fn fast_path() -> Option<FastPath<Self>> {
///         Some(FastPath::prost())
///     }
/// }
/// ```
pub trait WireMessage: Send + Sized + 'static {
    /// Compiled encode/decode routines for this type.
    fn fast_path() -> Option<FastPath<Self>> {
        None
    }

    /// The schema used by the reflection-based path.
    fn schema() -> Option<Schema<Self>> {
        None
    }
}

/// Type-specific serialization routines.
pub struct FastPath<T> {
    encoded_len: fn(&T) -> usize,
    encode: fn(&T, &mut dyn BufMut),
    decode: fn(&mut dyn Buf) -> Result<T, DecodeError>,
}

impl<T> Clone for FastPath<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FastPath<T> {}

impl<T: Message + Default> FastPath<T> {
    /// The routines `prost` derives for `T`.
    pub fn prost() -> Self {
        Self {
            encoded_len: prost_encoded_len::<T>,
            encode: prost_encode::<T>,
            decode: prost_decode::<T>,
        }
    }
}

impl<T> FastPath<T> {
    pub(crate) fn encoded_len(&self, message: &T) -> usize {
        (self.encoded_len)(message)
    }

    pub(crate) fn encode(&self, message: &T, dst: &mut dyn BufMut) {
        (self.encode)(message, dst)
    }

    pub(crate) fn decode(&self, src: &mut dyn Buf) -> Result<T, DecodeError> {
        (self.decode)(src)
    }
}

fn prost_encoded_len<T: Message>(message: &T) -> usize {
    message.encoded_len()
}

fn prost_encode<T: Message>(message: &T, mut dst: &mut dyn BufMut) {
    message.encode_raw(&mut dst)
}

fn prost_decode<T: Message + Default>(src: &mut dyn Buf) -> Result<T, DecodeError> {
    T::decode(src)
}

/// A message schema plus the conversions between `T` and a `DynamicMessage` of that schema.
pub struct Schema<T> {
    descriptor: MessageDescriptor,
    to_dynamic: fn(&T, &MessageDescriptor) -> Result<DynamicMessage, BoxError>,
    from_dynamic: fn(&DynamicMessage) -> Result<T, BoxError>,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            to_dynamic: self.to_dynamic,
            from_dynamic: self.from_dynamic,
        }
    }
}

impl<T: ReflectMessage + Default> Schema<T> {
    /// Uses the descriptor `T` reports about itself.
    pub fn reflect() -> Self {
        Self {
            descriptor: T::default().descriptor(),
            to_dynamic: reflect_to_dynamic::<T>,
            from_dynamic: reflect_from_dynamic::<T>,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Schema<T> {
    /// Maps `T` onto `descriptor` through its serde representation.
    ///
    /// Field names follow the Protobuf JSON mapping (lowerCamelCase), and fields holding
    /// their default value are omitted on the way back, so `T` should use `#[serde(default)]`.
    pub fn serde(descriptor: MessageDescriptor) -> Self {
        Self {
            descriptor,
            to_dynamic: serde_to_dynamic::<T>,
            from_dynamic: serde_from_dynamic::<T>,
        }
    }
}

impl<T> Schema<T> {
    /// Descriptor of the message this schema encodes.
    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    pub(crate) fn to_dynamic(&self, message: &T) -> Result<DynamicMessage, CodecError> {
        (self.to_dynamic)(message, &self.descriptor).map_err(|source| self.error(source))
    }

    pub(crate) fn from_dynamic(&self, dynamic: &DynamicMessage) -> Result<T, CodecError> {
        (self.from_dynamic)(dynamic).map_err(|source| self.error(source))
    }

    fn error(&self, source: BoxError) -> CodecError {
        CodecError::Schema {
            type_name: std::any::type_name::<T>(),
            message: self.descriptor.full_name().to_string(),
            source,
        }
    }
}

fn reflect_to_dynamic<T: ReflectMessage>(
    message: &T,
    _: &MessageDescriptor,
) -> Result<DynamicMessage, BoxError> {
    Ok(message.transcode_to_dynamic())
}

fn reflect_from_dynamic<T: Message + Default>(dynamic: &DynamicMessage) -> Result<T, BoxError> {
    Ok(dynamic.transcode_to::<T>()?)
}

fn serde_to_dynamic<T: Serialize>(
    message: &T,
    descriptor: &MessageDescriptor,
) -> Result<DynamicMessage, BoxError> {
    // DynamicMessage::deserialize accepts any Serde Deserializer,
    // and serde_json::Value is one.
    let value = serde_json::to_value(message)?;
    Ok(DynamicMessage::deserialize(descriptor.clone(), value)?)
}

fn serde_from_dynamic<T: DeserializeOwned>(dynamic: &DynamicMessage) -> Result<T, BoxError> {
    let value = serde_json::to_value(dynamic)?;
    Ok(serde_json::from_value(value)?)
}

/// The path picked for one concrete type.
pub(crate) enum Strategy<T> {
    Fast(FastPath<T>),
    Reflective(Schema<T>),
}

impl<T> Clone for Strategy<T> {
    fn clone(&self) -> Self {
        match self {
            Strategy::Fast(fast) => Strategy::Fast(*fast),
            Strategy::Reflective(schema) => Strategy::Reflective(schema.clone()),
        }
    }
}

type StrategyCache = RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>;

// One entry per concrete type, holding an `Option<Strategy<T>>`. `None` caches the
// unsupported verdict as well.
static STRATEGIES: LazyLock<StrategyCache> = LazyLock::new(Default::default);

impl<T: WireMessage> Strategy<T> {
    pub(crate) fn resolve() -> Result<Self, CodecError> {
        let cached = STRATEGIES
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Option<Strategy<T>>>())
            .cloned();

        let strategy = match cached {
            Some(strategy) => strategy,
            None => {
                let probed = Self::probe();
                tracing::trace!(
                    message = std::any::type_name::<T>(),
                    path = match &probed {
                        Some(Strategy::Fast(_)) => "fast",
                        Some(Strategy::Reflective(_)) => "reflective",
                        None => "unsupported",
                    },
                    "Resolved codec path"
                );
                STRATEGIES
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(TypeId::of::<T>(), Box::new(probed.clone()));
                probed
            }
        };

        strategy.ok_or(CodecError::UnsupportedMessageType {
            type_name: std::any::type_name::<T>(),
        })
    }

    fn probe() -> Option<Self> {
        T::fast_path()
            .map(Strategy::Fast)
            .or_else(|| T::schema().map(Strategy::Reflective))
    }
}
