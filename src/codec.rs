//! Binary frame for the data forwarding path.
//!
//! All integers are big-endian:
//!
//! ```text
//! frame := count:u16 item{count}
//! item  := token:i64 gen_id:u32 range_index:u8 name_len:u8 name data_len:u32 data
//! ```
//!
//! Decoding is zero-copy: item payloads are slices of the input buffer.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::constants::{FRAME_ITEM_HEADER_SIZE, MAX_FRAME_ITEMS, MAX_FRAME_NAME_LEN};
use crate::types::{Token, TopicDataId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("stream name is {0} bytes, longer than {max}", max = MAX_FRAME_NAME_LEN)]
    NameTooLong(usize),

    #[error("stream name is not valid UTF-8")]
    InvalidName,

    #[error("frame carries {0} items, more than {max}", max = MAX_FRAME_ITEMS)]
    TooManyItems(usize),

    #[error("payload of {0} bytes does not fit a u32 length")]
    PayloadTooLarge(usize),

    #[error("{0} trailing bytes after the last item")]
    TrailingBytes(usize),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// One replicated payload and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameItem {
    pub id: TopicDataId,
    pub data: Bytes,
}

impl FrameItem {
    pub fn new(id: TopicDataId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        FRAME_ITEM_HEADER_SIZE + self.id.name.len() + 4 + self.data.len()
    }
}

/// Encoded size of a frame holding `items`.
pub fn frame_len(items: &[FrameItem]) -> usize {
    2 + items.iter().map(FrameItem::encoded_len).sum::<usize>()
}

/// Encode `items` into `buffer`.
///
/// Nothing is written when any item is out of bounds.
pub fn encode_frame<B: BufMut>(items: &[FrameItem], buffer: &mut B) -> CodecResult<()> {
    if items.len() > MAX_FRAME_ITEMS {
        return Err(CodecError::TooManyItems(items.len()));
    }
    for item in items {
        if item.id.name.len() > MAX_FRAME_NAME_LEN {
            return Err(CodecError::NameTooLong(item.id.name.len()));
        }
        if u32::try_from(item.data.len()).is_err() {
            return Err(CodecError::PayloadTooLarge(item.data.len()));
        }
    }

    buffer.put_u16(items.len() as u16);
    for item in items {
        buffer.put_i64(item.id.token.value());
        buffer.put_u32(item.id.gen_id);
        buffer.put_u8(item.id.range_index);
        buffer.put_u8(item.id.name.len() as u8);
        buffer.put_slice(item.id.name.as_bytes());
        buffer.put_u32(item.data.len() as u32);
        buffer.put_slice(&item.data);
    }
    Ok(())
}

/// Encode `items` into a freshly allocated buffer.
pub fn encode_frame_to_bytes(items: &[FrameItem]) -> CodecResult<Bytes> {
    let mut buffer = Vec::with_capacity(frame_len(items));
    encode_frame(items, &mut buffer)?;
    Ok(Bytes::from(buffer))
}

fn ensure(input: &Bytes, needed: usize, field: &'static str) -> CodecResult<()> {
    if input.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed: needed - input.remaining(),
        });
    }
    Ok(())
}

/// Decode a complete frame. The input must contain exactly one frame.
pub fn decode_frame(mut input: Bytes) -> CodecResult<Vec<FrameItem>> {
    ensure(&input, 2, "item count")?;
    let count = input.get_u16() as usize;
    if count > MAX_FRAME_ITEMS {
        return Err(CodecError::TooManyItems(count));
    }

    // The count is untrusted; reserve no more than the input can hold.
    let min_item_len = FRAME_ITEM_HEADER_SIZE + 4;
    let mut items = Vec::with_capacity(count.min(input.remaining() / min_item_len));
    for _ in 0..count {
        ensure(&input, FRAME_ITEM_HEADER_SIZE, "item header")?;
        let token = Token(input.get_i64());
        let gen_id = input.get_u32();
        let range_index = input.get_u8();
        let name_len = input.get_u8() as usize;

        ensure(&input, name_len, "stream name")?;
        let name = String::from_utf8(input.split_to(name_len).to_vec())
            .map_err(|_| CodecError::InvalidName)?;

        ensure(&input, 4, "data length")?;
        let data_len = input.get_u32() as usize;
        ensure(&input, data_len, "data")?;
        let data = input.split_to(data_len);

        items.push(FrameItem {
            id: TopicDataId {
                name,
                token,
                gen_id,
                range_index,
            },
            data,
        });
    }

    if input.has_remaining() {
        return Err(CodecError::TrailingBytes(input.remaining()));
    }
    Ok(items)
}
