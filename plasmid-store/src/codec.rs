// SPDX-License-Identifier: MIT OR Apache-2.0

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ReplicationError;

/// Codec for CBOR-encoded messages on a byte stream.
///
/// CBOR items are self-delimiting, so no extra framing is required.
#[derive(Clone, Debug)]
pub struct CborCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        CborCodec {
            _phantom: PhantomData {},
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Encoder<T> for CborCodec<T>
where
    T: Serialize,
{
    type Error = ReplicationError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&item, &mut bytes)
            .map_err(|err| ReplicationError::Codec(err.to_string()))?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

impl<T> Decoder for CborCodec<T>
where
    T: DeserializeOwned,
{
    type Item = T;
    type Error = ReplicationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut reader: &[u8] = src.as_ref();
        let result: Result<Self::Item, _> = ciborium::from_reader(&mut reader);
        let consumed = src.len() - reader.len();

        match result {
            Ok(item) => {
                src.advance(consumed);
                Ok(Some(item))
            }
            // An incomplete item surfaces as an IO error, wait for more bytes.
            Err(ciborium::de::Error::Io(_)) => Ok(None),
            Err(err) => Err(ReplicationError::Codec(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::CborCodec;

    #[test]
    fn decode_partial_frames() {
        let mut codec = CborCodec::<(String, u64)>::new();
        let mut buffer = BytesMut::new();
        codec
            .encode(("hello".to_string(), 12), &mut buffer)
            .unwrap();
        codec
            .encode(("world".to_string(), 500), &mut buffer)
            .unwrap();

        // Feed the bytes in two halves, the first one cuts the second item.
        let bytes = buffer.split();
        let cut = bytes.len() - 3;
        let mut src = BytesMut::from(&bytes[..cut]);

        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(("hello".to_string(), 12))
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(&bytes[cut..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(("world".to_string(), 500))
        );
        assert!(src.is_empty());
    }
}
