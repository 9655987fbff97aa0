//! AWS event stream 二进制帧解码（Kiro 的响应体）
//!
//! 一帧：总长(4) 头部长(4) 前导 CRC(4) 头部 载荷 消息 CRC(4)，整数均为大端。
//! CRC 不校验，传输层已经有完整性保证。

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{GatewayError, Result};

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// 只保留字符串类型的头
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl EventFrame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn event_type(&self) -> &str {
        self.header(":event-type")
            .or_else(|| self.header(":exception-type"))
            .unwrap_or_default()
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.header(":message-type"), Some("exception" | "error"))
    }
}

/// 上游在流内报的异常帧 -> 错误；按异常类型映射出等价的 HTTP 状态
pub fn exception_error(frame: &EventFrame) -> GatewayError {
    let kind = frame.event_type();
    let message = serde_json::from_slice::<Value>(&frame.payload)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).chars().take(300).collect());
    let status = match kind {
        k if k.contains("Throttling") => Some(429),
        k if k.contains("AccessDenied") => Some(403),
        k if k.contains("ExpiredToken") || k.contains("Unauthorized") => Some(401),
        k if k.contains("Validation") => Some(400),
        _ => None,
    };
    GatewayError::upstream(status, format!("{}: {}", kind, message.trim()))
}

/// 增量解码：网络分片随到随喂，凑满一帧就吐一帧
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 还有没凑成整帧的残余字节
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn next_frame(&mut self) -> Result<Option<EventFrame>> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total = be_u32(&self.buf[0..4]) as usize;
        let headers_len = be_u32(&self.buf[4..8]) as usize;
        if total < PRELUDE_LEN + TRAILER_LEN
            || total > MAX_FRAME_LEN
            || headers_len > total - PRELUDE_LEN - TRAILER_LEN
        {
            return Err(GatewayError::upstream(
                None,
                format!(
                    "malformed event stream frame (length {}, headers {})",
                    total, headers_len
                ),
            ));
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])?;
        let payload = frame[headers_end..total - TRAILER_LEN].to_vec();
        Ok(Some(EventFrame { headers, payload }))
    }
}

/// 整个响应体一次解完；末尾不完整的帧丢弃
pub fn decode_all(body: &[u8]) -> Result<Vec<EventFrame>> {
    let mut decoder = FrameDecoder::default();
    decoder.push(body);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    if decoder.has_partial() {
        tracing::debug!("Dropping {} trailing bytes of a truncated frame", decoder.buf.len());
    }
    Ok(frames)
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u16(b: &[u8]) -> usize {
    u16::from_be_bytes([b[0], b[1]]) as usize
}

fn take<'a>(raw: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(n).filter(|end| *end <= raw.len()).ok_or_else(|| {
        GatewayError::upstream(None, "event stream header runs past its frame")
    })?;
    let out = &raw[*pos..end];
    *pos = end;
    Ok(out)
}

fn parse_headers(raw: &[u8]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    let mut pos = 0;
    while pos < raw.len() {
        let name_len = take(raw, &mut pos, 1)?[0] as usize;
        let name = String::from_utf8_lossy(take(raw, &mut pos, name_len)?).into_owned();
        let value_type = take(raw, &mut pos, 1)?[0];
        match value_type {
            // bool true / false 不占值字节
            0 | 1 => {}
            2 => {
                take(raw, &mut pos, 1)?;
            }
            3 => {
                take(raw, &mut pos, 2)?;
            }
            4 => {
                take(raw, &mut pos, 4)?;
            }
            5 | 8 => {
                take(raw, &mut pos, 8)?;
            }
            6 => {
                let len = be_u16(take(raw, &mut pos, 2)?);
                take(raw, &mut pos, len)?;
            }
            7 => {
                let len = be_u16(take(raw, &mut pos, 2)?);
                let value = String::from_utf8_lossy(take(raw, &mut pos, len)?).into_owned();
                headers.insert(name, value);
            }
            9 => {
                take(raw, &mut pos, 16)?;
            }
            other => {
                return Err(GatewayError::upstream(
                    None,
                    format!("unknown event stream header type {}", other),
                ));
            }
        }
    }
    Ok(headers)
}
