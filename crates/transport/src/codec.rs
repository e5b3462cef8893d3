//! Newline-delimited JSON framing.
//!
//! One message per line, UTF-8, `\n` terminated. [`NdjsonCodec`] wraps
//! [`LinesCodec`] with a per-line limit and turns every bad line (too long,
//! blank, not UTF-8, not a message) into [`Inbound::Rejected`] instead of a
//! stream error, so a single bad frame never tears down the channel.

use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::TransportError;

/// Default per-line limit, 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One decoded inbound line.
#[derive(Debug)]
pub enum Inbound<T> {
    Message(T),
    /// The line was consumed but did not carry a usable message.
    Rejected(TransportError),
}

/// Decodes `In` frames and encodes `Out` frames.
#[derive(Debug)]
pub struct NdjsonCodec<In, Out> {
    lines: LinesCodec,
    max_frame_bytes: usize,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> NdjsonCodec<In, Out> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
            _marker: PhantomData,
        }
    }

    fn classify(
        &self,
        line: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Inbound<In>>, TransportError>
    where
        In: DeserializeOwned,
    {
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                return Ok(Some(Inbound::Rejected(TransportError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                })))
            }
            Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                return Ok(Some(Inbound::Rejected(TransportError::InvalidUtf8(err))))
            }
            Err(LinesCodecError::Io(err)) => return Err(TransportError::Io(err)),
        };

        if line.trim().is_empty() {
            return Ok(Some(Inbound::Rejected(TransportError::BlankFrame)));
        }
        Ok(Some(match serde_json::from_str(&line) {
            Ok(message) => Inbound::Message(message),
            Err(err) => Inbound::Rejected(TransportError::Malformed(err)),
        }))
    }
}

impl<In, Out> Default for NdjsonCodec<In, Out> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<In: DeserializeOwned, Out> Decoder for NdjsonCodec<In, Out> {
    type Item = Inbound<In>;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let line = self.lines.decode(src);
        self.classify(line)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let line = self.lines.decode_eof(src);
        self.classify(line)
    }
}

impl<In, Out: Serialize> Encoder<Out> for NdjsonCodec<In, Out> {
    type Error = TransportError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item).map_err(TransportError::Encode)?;
        self.lines.encode(line, dst).map_err(|err| match err {
            LinesCodecError::Io(err) => TransportError::Io(err),
            LinesCodecError::MaxLineLengthExceeded => TransportError::FrameTooLarge {
                limit: self.max_frame_bytes,
            },
        })
    }
}
