//! `tonic::codec::Codec` adapter around [`MessageCodec`].
//!
//! Generated bindings instantiate the codec through `Default`, so the message types are
//! carried as phantom parameters while the work is delegated to the shared codec.
use super::{MessageCodec, WireMessage};
use std::marker::PhantomData;
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// The adaptive codec as seen by tonic.
///
/// * `T` - The type written to the wire.
/// * `U` - The type read from the wire.
#[derive(Debug, Clone)]
pub struct AdaptiveCodec<T, U> {
    codec: MessageCodec,
    _pd: PhantomData<(T, U)>,
}

impl<T, U> AdaptiveCodec<T, U> {
    pub fn new(codec: MessageCodec) -> Self {
        Self {
            codec,
            _pd: PhantomData,
        }
    }
}

impl<T, U> Default for AdaptiveCodec<T, U> {
    fn default() -> Self {
        Self::new(MessageCodec)
    }
}

impl<T, U> Codec for AdaptiveCodec<T, U>
where
    T: WireMessage,
    U: WireMessage,
{
    type Encode = T;
    type Decode = U;

    type Encoder = AdaptiveEncoder<T>;
    type Decoder = AdaptiveDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        AdaptiveEncoder(self.codec, PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        AdaptiveDecoder(self.codec, PhantomData)
    }
}

/// Writes one message straight into tonic's frame buffer.
#[derive(Debug)]
pub struct AdaptiveEncoder<T>(MessageCodec, PhantomData<T>);

impl<T: WireMessage> Encoder for AdaptiveEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        self.0.encode_into(&item, dst).map_err(Status::from)
    }
}

/// Reads one message out of a length-delimited gRPC frame.
#[derive(Debug)]
pub struct AdaptiveDecoder<U>(MessageCodec, PhantomData<U>);

impl<U: WireMessage> Decoder for AdaptiveDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_from(src).map(Some).map_err(Status::from)
    }
}
