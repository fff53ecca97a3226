// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CDR2 LE encoding for the topic types.
//!
//! Layout rules (must stay in sync between encode and decode):
//! - strings: u32 length including the null terminator, bytes, `\0`
//! - sequences: u32 element count, then elements
//! - optionals: sequence of length 0 (absent) or 1 (present)
//! - u32/i32/f32 are aligned to 4 bytes from the start of the body
//! - bool is a single byte

use hdds::core::types::TypeDescriptor;
use hdds::dds::{Error, Result};
use hdds::DdsTrait;

use super::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ServerStatus};

static CHAT_REQUEST_DESCRIPTOR: TypeDescriptor = TypeDescriptor::new(
    0x4C44_5251, // "LDRQ"
    "llama_dds::ChatCompletionRequest",
    0,
    4,
    true,
    &[],
);

static CHAT_RESPONSE_DESCRIPTOR: TypeDescriptor = TypeDescriptor::new(
    0x4C44_5253, // "LDRS"
    "llama_dds::ChatCompletionResponse",
    0,
    4,
    true,
    &[],
);

static SERVER_STATUS_DESCRIPTOR: TypeDescriptor = TypeDescriptor::new(
    0x4C44_5354, // "LDST"
    "llama_dds::ServerStatus",
    0,
    4,
    true,
    &[],
);

/// Field-by-field CDR writer over a caller-provided buffer.
struct Enc<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Enc<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn align4(&mut self) -> Result<()> {
        while self.pos % 4 != 0 {
            self.put_u8(0)?;
        }
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> Result<()> {
        if self.pos >= self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.pos] = v;
        self.pos += 1;
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.align4()?;
        if self.pos + 4 > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put_u32(v as u32)
    }

    fn put_f32(&mut self, v: f32) -> Result<()> {
        self.align4()?;
        if self.pos + 4 > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
        Ok(())
    }

    fn put_bool(&mut self, v: bool) -> Result<()> {
        self.put_u8(u8::from(v))
    }

    fn put_str(&mut self, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        self.put_u32(bytes.len() as u32 + 1)?;
        if self.pos + bytes.len() + 1 > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.buf[self.pos] = 0;
        self.pos += 1;
        Ok(())
    }
}

/// Matching reader. Truncated or malformed input maps to
/// `Error::SerializationError`.
struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn align4(&mut self) -> Result<()> {
        while self.pos % 4 != 0 {
            self.get_u8()?;
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        let v = *self.buf.get(self.pos).ok_or(Error::SerializationError)?;
        self.pos += 1;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.align4()?;
        if self.pos + 4 > self.buf.len() {
            return Err(Error::SerializationError);
        }
        let v = u32::from_le_bytes(
            self.buf[self.pos..self.pos + 4]
                .try_into()
                .map_err(|_| Error::SerializationError)?,
        );
        self.pos += 4;
        Ok(v)
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    fn get_f32(&mut self) -> Result<f32> {
        self.align4()?;
        if self.pos + 4 > self.buf.len() {
            return Err(Error::SerializationError);
        }
        let v = f32::from_le_bytes(
            self.buf[self.pos..self.pos + 4]
                .try_into()
                .map_err(|_| Error::SerializationError)?,
        );
        self.pos += 4;
        Ok(v)
    }

    fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        if len == 0 || self.pos + len > self.buf.len() {
            return Err(Error::SerializationError);
        }
        let bytes = &self.buf[self.pos..self.pos + len - 1];
        self.pos += len;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Sequence element counts are sanity-capped so a corrupt length prefix
    /// cannot drive an allocation larger than the remaining buffer.
    fn get_count(&mut self) -> Result<usize> {
        let n = self.get_u32()? as usize;
        if n > self.buf.len() {
            return Err(Error::SerializationError);
        }
        Ok(n)
    }
}

fn put_message(e: &mut Enc<'_>, msg: &ChatMessage) -> Result<()> {
    e.put_str(&msg.role)?;
    e.put_str(&msg.content)
}

fn get_message(d: &mut Dec<'_>) -> Result<ChatMessage> {
    Ok(ChatMessage {
        role: d.get_str()?,
        content: d.get_str()?,
    })
}

impl DdsTrait for ChatCompletionRequest {
    fn type_descriptor() -> &'static TypeDescriptor {
        &CHAT_REQUEST_DESCRIPTOR
    }

    fn encode_cdr2(&self, buf: &mut [u8]) -> Result<usize> {
        let mut e = Enc::new(buf);
        e.put_str(&self.request_id)?;
        e.put_str(&self.model)?;
        e.put_u32(self.messages.len() as u32)?;
        for msg in &self.messages {
            put_message(&mut e, msg)?;
        }
        e.put_f32(self.temperature)?;
        e.put_i32(self.max_tokens)?;
        e.put_bool(self.stream)?;
        match self.top_p {
            Some(v) => {
                e.put_u32(1)?;
                e.put_f32(v)?;
            }
            None => e.put_u32(0)?,
        }
        match self.n {
            Some(v) => {
                e.put_u32(1)?;
                e.put_i32(v)?;
            }
            None => e.put_u32(0)?,
        }
        match &self.stop {
            Some(words) => {
                e.put_u32(words.len() as u32)?;
                for w in words {
                    e.put_str(w)?;
                }
            }
            None => e.put_u32(0)?,
        }
        e.align4()?;
        Ok(e.pos)
    }

    fn decode_cdr2(buf: &[u8]) -> Result<Self> {
        let mut d = Dec::new(buf);
        let request_id = d.get_str()?;
        let model = d.get_str()?;
        let n_messages = d.get_count()?;
        let mut messages = Vec::with_capacity(n_messages);
        for _ in 0..n_messages {
            messages.push(get_message(&mut d)?);
        }
        let temperature = d.get_f32()?;
        let max_tokens = d.get_i32()?;
        let stream = d.get_bool()?;
        let top_p = match d.get_count()? {
            0 => None,
            _ => Some(d.get_f32()?),
        };
        let n = match d.get_count()? {
            0 => None,
            _ => Some(d.get_i32()?),
        };
        // A zero-length stop sequence reads back as absent, mirroring the
        // wire convention for optionals.
        let n_stop = d.get_count()?;
        let stop = if n_stop == 0 {
            None
        } else {
            let mut words = Vec::with_capacity(n_stop);
            for _ in 0..n_stop {
                words.push(d.get_str()?);
            }
            Some(words)
        };
        Ok(Self {
            request_id,
            model,
            messages,
            temperature,
            max_tokens,
            stream,
            top_p,
            n,
            stop,
        })
    }
}

impl DdsTrait for ChatCompletionResponse {
    fn type_descriptor() -> &'static TypeDescriptor {
        &CHAT_RESPONSE_DESCRIPTOR
    }

    fn encode_cdr2(&self, buf: &mut [u8]) -> Result<usize> {
        let mut e = Enc::new(buf);
        e.put_str(&self.request_id)?;
        e.put_str(&self.model)?;
        e.put_str(&self.content)?;
        // None travels as the empty string, like a null char* on the C wire.
        e.put_str(self.finish_reason.as_deref().unwrap_or(""))?;
        e.put_bool(self.is_final)?;
        e.put_i32(self.prompt_tokens)?;
        e.put_i32(self.completion_tokens)?;
        e.align4()?;
        Ok(e.pos)
    }

    fn decode_cdr2(buf: &[u8]) -> Result<Self> {
        let mut d = Dec::new(buf);
        let request_id = d.get_str()?;
        let model = d.get_str()?;
        let content = d.get_str()?;
        let reason = d.get_str()?;
        let finish_reason = if reason.is_empty() { None } else { Some(reason) };
        let is_final = d.get_bool()?;
        let prompt_tokens = d.get_i32()?;
        let completion_tokens = d.get_i32()?;
        Ok(Self {
            request_id,
            model,
            content,
            finish_reason,
            is_final,
            prompt_tokens,
            completion_tokens,
        })
    }
}

impl DdsTrait for ServerStatus {
    fn type_descriptor() -> &'static TypeDescriptor {
        &SERVER_STATUS_DESCRIPTOR
    }

    fn encode_cdr2(&self, buf: &mut [u8]) -> Result<usize> {
        let mut e = Enc::new(buf);
        e.put_str(&self.server_id)?;
        e.put_i32(self.slots_idle)?;
        e.put_i32(self.slots_processing)?;
        e.put_str(&self.model_loaded)?;
        e.put_bool(self.ready)?;
        e.align4()?;
        Ok(e.pos)
    }

    fn decode_cdr2(buf: &[u8]) -> Result<Self> {
        let mut d = Dec::new(buf);
        Ok(Self {
            server_id: d.get_str()?,
            slots_idle: d.get_i32()?,
            slots_processing: d.get_i32()?,
            model_loaded: d.get_str()?,
            ready: d.get_bool()?,
        })
    }
}
