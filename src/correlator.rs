//! Turns the push-style inbound serial notifications into one awaited reply.

use std::{future::Future, time::Duration};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    error::{CorrelateError, LinkError},
    logging::category,
    serial_link::{Chunk, LineAssembler, SerialLink},
    types::DeviceDescriptor,
};

pub const DEVICE_INFO_REQUEST: &str = "{\"DevInfo\":{}}";

/// Sends a request and resolves with the first inbound line accepted by
/// `matches`.
///
/// Text still waiting for its line terminator resolves only once it also
/// parses as a whole JSON document, since the rest may still be in flight.
///
/// `inbound` must be subscribed before the request goes out, which the
/// signature enforces: the receiver already exists when `send_request` is
/// polled. Later matches are ignored; the receiver is dropped on return, which
/// also revokes the subscription on timeout.
pub async fn request_and_wait<S, M>(
    mut inbound: broadcast::Receiver<Chunk>,
    send_request: S,
    matches: M,
    timeout: Duration,
) -> Result<String, CorrelateError>
where
    S: Future<Output = Result<(), LinkError>>,
    M: Fn(&str) -> bool,
{
    send_request.await?;

    let wait = async {
        let mut lines = LineAssembler::default();
        loop {
            let chunk = match inbound.recv().await {
                Ok(chunk) => chunk,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        target: category::SERIAL,
                        "dropped {skipped} inbound chunks while waiting"
                    );
                    continue;
                }
                Err(RecvError::Closed) => return Err(CorrelateError::Closed),
            };
            for line in lines.push(&chunk) {
                if matches(&line) {
                    return Ok(line);
                }
                debug!(target: category::SERIAL, "ignoring unmatched line: {line}");
            }
            let pending = lines.pending();
            if !pending.is_empty() && matches(&pending) && is_json_document(&pending) {
                return Ok(pending);
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(CorrelateError::Timeout(timeout)),
    }
}

/// Any line carrying the device-info marker. Whether it is usable is decided
/// by [`DeviceDescriptor::from_response`].
pub fn is_device_info_reply(line: &str) -> bool {
    line.contains("\"DevInfo\"")
}

fn is_json_document(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}

/// Requests the device descriptor over an open sensor link.
///
/// Returns `Ok(None)` when the reply is present but unusable (bad result code,
/// empty access point name) so the surrounding retry re-runs the handshake.
pub async fn request_device_info(
    link: &mut dyn SerialLink,
    timeout: Duration,
) -> Result<Option<DeviceDescriptor>, CorrelateError> {
    let inbound = link.subscribe();
    let request = crate::serial_link::frame_command(DEVICE_INFO_REQUEST);
    info!(target: category::SERIAL, "requesting device info: {DEVICE_INFO_REQUEST}");
    let reply =
        request_and_wait(inbound, link.send(&request), is_device_info_reply, timeout).await?;

    match DeviceDescriptor::from_response(&reply) {
        Ok(descriptor) => {
            info!(
                target: category::SERIAL,
                "device info: product={} fw={} ap={}",
                descriptor.product,
                descriptor.firmware_version,
                descriptor.ap_name
            );
            Ok(Some(descriptor))
        }
        Err(err) => {
            warn!(target: category::SERIAL, "unusable device info reply ({err}): {reply}");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn chunk(text: &str) -> Chunk {
        Arc::from(text.as_bytes())
    }

    #[tokio::test]
    async fn first_match_wins_and_second_is_ignored() {
        let (tx, rx) = broadcast::channel(8);
        let sender = tx.clone();
        let send = async move {
            let _ = sender.send(chunk("noise\r\n"));
            let _ = sender.send(chunk("{\"DevInfo\":{\"ap_name\":\"first\"},\"res\":0}\r\n"));
            let _ = sender.send(chunk("{\"DevInfo\":{\"ap_name\":\"second\"},\"res\":0}\r\n"));
            Ok(())
        };

        let reply = request_and_wait(rx, send, is_device_info_reply, Duration::from_secs(1))
            .await
            .expect("resolved");
        assert!(reply.contains("first"));

        // Receiver was dropped with the wait; later sends find no subscriber.
        assert_eq!(tx.receiver_count(), 0);
        assert!(tx.send(chunk("late\r\n")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_revokes_subscription() {
        let (tx, rx) = broadcast::channel::<Chunk>(8);
        let result = request_and_wait(
            rx,
            async { Ok(()) },
            is_device_info_reply,
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(CorrelateError::Timeout(_))));
        assert_eq!(tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn reply_without_terminator_resolves_from_pending_text() {
        let (tx, rx) = broadcast::channel(8);
        let send = async move {
            let _ = tx.send(chunk("{\"DevInfo\":{\"ap_name\":"));
            let _ = tx.send(chunk("\"AP\"},\"res\":0}"));
            Ok(())
        };
        let reply = request_and_wait(rx, send, is_device_info_reply, Duration::from_secs(1))
            .await
            .expect("resolved");
        assert_eq!(reply, "{\"DevInfo\":{\"ap_name\":\"AP\"},\"res\":0}");
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_terminated_reply_resolves_without_waiting_out_timeout() {
        let (tx, rx) = broadcast::channel(8);
        let send = async move {
            let _ = tx.send(chunk("{\"DevInfo\":{\"product\":\"W1\",\"ap_na\r\n"));
            Ok(())
        };
        let begun = tokio::time::Instant::now();
        let reply = request_and_wait(rx, send, is_device_info_reply, Duration::from_secs(10))
            .await
            .expect("resolved");
        assert_eq!(reply, "{\"DevInfo\":{\"product\":\"W1\",\"ap_na");
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert!(DeviceDescriptor::from_response(&reply).is_err());
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let (_tx, rx) = broadcast::channel::<Chunk>(8);
        let result = request_and_wait(
            rx,
            async { Err(LinkError::NotOpen) },
            is_device_info_reply,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(CorrelateError::Send(LinkError::NotOpen))));
    }
}
