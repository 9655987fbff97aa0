use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::RequestBuilder;
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Event, EventSource, RequestBuilderExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::record::{Attempt, Recorder};
use super::transport_error;
use super::usage::fallback_stream_usage;
use crate::error::{GatewayError, Result};
use crate::protocol::{ProtocolConverter, StreamFrames};
use crate::protocol::canonical::ChatRequest;
use crate::providers::eventstream::{FrameDecoder, exception_error};
use crate::providers::{StreamFraming, StreamState, UpstreamAdapter, upstream_error_message};
use crate::routing::InFlightGuard;

type Chunk = std::result::Result<Bytes, std::io::Error>;

/// 已建立的上游流；这之后的失败不再换凭据
pub enum OpenedStream {
    /// 已收到 Open 的 SSE 流
    Sse(EventSource),
    /// 状态码成功、按 AWS event stream 成帧的响应体
    Frames {
        body: BoxStream<'static, reqwest::Result<Bytes>>,
        decoder: FrameDecoder,
    },
}

/// 一个上游事件：事件名和数据
struct UpstreamEvent {
    event: String,
    data: String,
}

impl OpenedStream {
    /// None 表示上游正常结束
    async fn next_event(&mut self) -> Option<Result<UpstreamEvent>> {
        match self {
            Self::Sse(es) => loop {
                match es.next().await {
                    None | Some(Err(reqwest_eventsource::Error::StreamEnded)) => return None,
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        return Some(Ok(UpstreamEvent {
                            event: message.event,
                            data: message.data,
                        }));
                    }
                    Some(Err(e)) => return Some(Err(stream_error(e).await)),
                }
            },
            Self::Frames { body, decoder } => loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) if frame.is_exception() => {
                        return Some(Err(exception_error(&frame)));
                    }
                    Ok(Some(frame)) => {
                        return Some(Ok(UpstreamEvent {
                            event: frame.event_type().to_string(),
                            data: String::from_utf8_lossy(&frame.payload).into_owned(),
                        }));
                    }
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
                match body.next().await {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => return Some(Err(transport_error(e))),
                    None => {
                        if decoder.has_partial() {
                            return Some(Err(GatewayError::upstream(
                                None,
                                "upstream closed the stream in the middle of a frame",
                            )));
                        }
                        return None;
                    }
                }
            },
        }
    }

    fn close(&mut self) {
        if let Self::Sse(es) = self {
            es.close();
        }
    }
}

/// 发起流式请求并等到上游确认；这之前的失败还可以换凭据重试
pub async fn open_stream(
    builder: RequestBuilder,
    timeout: Duration,
    framing: StreamFraming,
) -> Result<OpenedStream> {
    match framing {
        StreamFraming::Sse => open_sse(builder, timeout).await,
        StreamFraming::AwsEventStream => open_frames(builder, timeout).await,
    }
}

async fn open_sse(builder: RequestBuilder, timeout: Duration) -> Result<OpenedStream> {
    let mut es = builder
        .eventsource()
        .map_err(|e| GatewayError::Format(format!("cannot build stream request: {}", e)))?;
    es.set_retry_policy(Box::new(Never));

    loop {
        let first = match tokio::time::timeout(timeout, es.next()).await {
            Ok(ev) => ev,
            Err(_) => {
                es.close();
                return Err(open_timeout(timeout));
            }
        };
        match first {
            Some(Ok(Event::Open)) => return Ok(OpenedStream::Sse(es)),
            // Open 之前不会有消息
            Some(Ok(Event::Message(_))) => continue,
            Some(Err(e)) => {
                es.close();
                return Err(stream_error(e).await);
            }
            None => {
                return Err(GatewayError::upstream(
                    None,
                    "upstream closed the stream before it opened",
                ));
            }
        }
    }
}

/// 二进制帧流没有 Open 事件，以响应头到达且状态码成功为准
async fn open_frames(builder: RequestBuilder, timeout: Duration) -> Result<OpenedStream> {
    let resp = tokio::time::timeout(timeout, builder.send())
        .await
        .map_err(|_| open_timeout(timeout))?
        .map_err(transport_error)?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GatewayError::upstream(
            Some(status.as_u16()),
            upstream_error_message(status.as_u16(), &body),
        ));
    }
    Ok(OpenedStream::Frames {
        body: resp.bytes_stream().boxed(),
        decoder: FrameDecoder::default(),
    })
}

fn open_timeout(timeout: Duration) -> GatewayError {
    GatewayError::Timeout(format!(
        "upstream did not open the stream within {}s",
        timeout.as_secs()
    ))
}

async fn stream_error(e: reqwest_eventsource::Error) -> GatewayError {
    use reqwest_eventsource::Error as EsError;
    match e {
        EsError::InvalidStatusCode(status, resp) => {
            let body = resp.text().await.unwrap_or_default();
            GatewayError::upstream(
                Some(status.as_u16()),
                upstream_error_message(status.as_u16(), &body),
            )
        }
        EsError::InvalidContentType(content_type, resp) => {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            GatewayError::upstream(
                Some(status),
                format!(
                    "unexpected stream content type {:?}: {}",
                    content_type,
                    body.chars().take(300).collect::<String>()
                ),
            )
        }
        EsError::Transport(e) if e.is_timeout() => GatewayError::Timeout(e.to_string()),
        EsError::Transport(e) => GatewayError::Http(e),
        EsError::StreamEnded => GatewayError::upstream(None, "upstream stream ended unexpectedly"),
        other => GatewayError::upstream(None, other.to_string()),
    }
}

enum Outcome {
    Completed,
    Failed(GatewayError),
    Disconnected,
}

/// 把上游事件流逐块转成客户端协议并立即写出
pub struct StreamRelay {
    pub recorder: Recorder,
    pub attempt: Attempt,
    pub adapter: &'static dyn UpstreamAdapter,
    pub converter: &'static dyn ProtocolConverter,
    /// 客户端原始请求（模型名为客户端所见）
    pub request: ChatRequest,
    pub idle_timeout: Duration,
    pub guard: InFlightGuard,
}

impl StreamRelay {
    pub fn into_response(self, opened: OpenedStream) -> Response {
        let (tx, rx) = mpsc::unbounded_channel::<Chunk>();
        let content_type = self.converter.stream_content_type();
        tokio::spawn(self.run(opened, tx));

        let mut response = Response::new(Body::from_stream(UnboundedReceiverStream::new(rx)));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    async fn run(self, opened: OpenedStream, tx: mpsc::UnboundedSender<Chunk>) {
        let StreamRelay {
            recorder,
            attempt,
            adapter,
            converter,
            request,
            idle_timeout,
            guard,
        } = self;
        let mut upstream = opened;
        let mut state = StreamState::new(&request.model);
        let mut frames = StreamFrames::default();
        let mut outcome = Outcome::Completed;

        if let Some(preamble) = converter.stream_preamble(&state.id, &state.model, &mut frames)
            && tx.send(Ok(Bytes::from(preamble))).is_err()
        {
            outcome = Outcome::Disconnected;
        }

        'relay: while matches!(outcome, Outcome::Completed) {
            let next = tokio::select! {
                _ = tx.closed() => {
                    outcome = Outcome::Disconnected;
                    break;
                }
                next = tokio::time::timeout(idle_timeout, upstream.next_event()) => next,
            };
            let event = match next {
                Ok(ev) => ev,
                Err(_) => {
                    outcome = Outcome::Failed(GatewayError::Timeout(format!(
                        "no upstream data for {}s",
                        idle_timeout.as_secs()
                    )));
                    break;
                }
            };
            match event {
                None => break,
                Some(Ok(ev)) => {
                    match adapter.translate_event(&ev.event, &ev.data, &mut state) {
                        Ok(lines) => {
                            for line in lines {
                                // 格式化失败的块直接丢弃，不中断流
                                if let Some(out) = converter.format_stream_chunk(&line, &mut frames)
                                    && tx.send(Ok(Bytes::from(out))).is_err()
                                {
                                    outcome = Outcome::Disconnected;
                                    break 'relay;
                                }
                            }
                        }
                        Err(e) => {
                            outcome = Outcome::Failed(e);
                            break;
                        }
                    }
                    if state.done {
                        break;
                    }
                }
                Some(Err(e)) => {
                    outcome = Outcome::Failed(e);
                    break;
                }
            }
        }
        upstream.close();

        match outcome {
            Outcome::Completed => {
                if !state.done {
                    let mut tail = adapter.finish_stream(&mut state, &request);
                    if !state.done {
                        tail.push(state.done_line());
                    }
                    for line in tail {
                        if let Some(out) = converter.format_stream_chunk(&line, &mut frames) {
                            let _ = tx.send(Ok(Bytes::from(out)));
                        }
                    }
                }
                let usage = state
                    .usage
                    .filter(|u| u.total_tokens > 0)
                    .unwrap_or_else(|| fallback_stream_usage(&request));
                recorder.success(&attempt, usage).await;
            }
            Outcome::Failed(e) => {
                let _ = tx.send(Ok(Bytes::from(converter.format_stream_error(&e.to_string()))));
                recorder.failure(&attempt, &e).await;
            }
            Outcome::Disconnected => recorder.disconnected(&attempt).await,
        }
        drop(guard);
    }
}
