//! Per-connection frame session
//!
//! A [`Session`] owns both directions of one connection and runs them as two
//! tasks: the reader task decodes inbound frames, answers Ping with Pong and
//! echoes the peer's Close; the writer task serializes outbound frames in
//! submission order. The application sees a frame receiver and a frame sender.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::Config;
use crate::channel::{ByteReader, ByteWriter};
use crate::codec::{FrameReader, FrameWriter, Role};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameType};

/// Frames queued in each direction
const FRAME_QUEUE: usize = 64;

/// Reason of the Close frame this side sent, once one went out
type SentClose = Arc<Mutex<Option<CloseReason>>>;

/// Channel pair for one connection
pub struct Session {
    incoming: mpsc::Receiver<Frame>,
    outgoing: mpsc::Sender<Frame>,
    closed: Option<oneshot::Receiver<CloseReason>>,
    close_reason: Option<CloseReason>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Session {
    /// Spawn the reader and writer tasks on the current runtime
    pub fn spawn(source: ByteReader, sink: ByteWriter, role: Role, config: Config) -> Self {
        let reader = FrameReader::new(source, role, &config);
        let writer = FrameWriter::new(sink, role);

        let (incoming_tx, incoming) = mpsc::channel(FRAME_QUEUE);
        let (outgoing, outgoing_rx) = mpsc::channel(FRAME_QUEUE);
        let (closed_tx, closed) = oneshot::channel();
        let sent_close = SentClose::default();

        let writer_task = tokio::spawn(write_loop(writer, outgoing_rx, sent_close.clone()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            incoming_tx,
            outgoing.clone(),
            closed_tx,
            sent_close,
        ));

        Self {
            incoming,
            outgoing,
            closed: Some(closed),
            close_reason: None,
            reader_task,
            writer_task,
        }
    }

    /// Next inbound frame; `None` once the peer closed or the connection died
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Queue a frame for the peer
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Start the closing handshake
    pub async fn close(&self, reason: Option<CloseReason>) -> Result<()> {
        self.send(Frame::close(reason)).await
    }

    /// Sender for outbound frames, usable from other tasks
    pub fn sender(&self) -> mpsc::Sender<Frame> {
        self.outgoing.clone()
    }

    /// Resolve to the peer's close reason, else the reason of the Close this
    /// side sent, else the abnormal-closure reason
    pub async fn closed(&mut self) -> CloseReason {
        if let Some(reason) = &self.close_reason {
            return reason.clone();
        }
        let reason = match self.closed.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| CloseReason::abnormal()),
            None => CloseReason::abnormal(),
        };
        self.close_reason = Some(reason.clone());
        reason
    }

    /// Whether both tasks have stopped
    pub fn is_finished(&self) -> bool {
        self.reader_task.is_finished() && self.writer_task.is_finished()
    }

    /// Stop both tasks without a closing handshake
    pub fn abort(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("close_reason", &self.close_reason)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn read_loop(
    mut reader: FrameReader,
    incoming: mpsc::Sender<Frame>,
    outgoing: mpsc::Sender<Frame>,
    closed: oneshot::Sender<CloseReason>,
    sent_close: SentClose,
) {
    let reason = loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                let mut close = None;
                match frame.frame_type() {
                    FrameType::Ping => {
                        let _ = outgoing.send(Frame::pong(frame.payload().clone())).await;
                    }
                    FrameType::Close => {
                        let reason = frame.close_reason();
                        // the writer drops this if we already sent our own Close
                        let _ = outgoing.send(Frame::close(reason.clone())).await;
                        close = Some(
                            reason.unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, "")),
                        );
                    }
                    _ => {}
                }

                // keep answering pings even if the application stopped listening
                let _ = incoming.send(frame).await;

                if let Some(reason) = close {
                    tracing::debug!(%reason, "peer closed the session");
                    break reason;
                }
            }
            Ok(None) => {
                tracing::debug!("connection ended without a close frame");
                break sent_reason(&sent_close);
            }
            Err(err) => {
                let reason = sent_reason(&sent_close);
                let code = err.close_code();
                if CloseReason::is_valid_code(code) {
                    let _ = outgoing
                        .send(Frame::close(Some(CloseReason::new(code, ""))))
                        .await;
                }
                tracing::debug!(error = %err, "session read failed");
                break reason;
            }
        }
    };
    let _ = closed.send(reason);
}

fn sent_reason(sent_close: &SentClose) -> CloseReason {
    sent_close.lock().clone().unwrap_or_else(CloseReason::abnormal)
}

async fn write_loop(
    mut writer: FrameWriter,
    mut outgoing: mpsc::Receiver<Frame>,
    sent_close: SentClose,
) {
    while let Some(frame) = outgoing.recv().await {
        let is_close = frame.frame_type() == FrameType::Close;
        if is_close {
            let mut sent = sent_close.lock();
            if sent.is_some() {
                continue;
            }
            *sent = Some(
                frame
                    .close_reason()
                    .unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, "")),
            );
        }

        if let Err(err) = writer.write_frame(frame).await {
            tracing::debug!(error = %err, "session write failed");
            return;
        }

        if is_close {
            break;
        }
    }
    writer.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;

    /// Session acting as the server plus the client-side codec of its peer
    fn connected() -> (Session, FrameWriter, FrameReader) {
        let config = Config::default();
        let (peer_tx, server_rx) = channel(4096);
        let (server_tx, peer_rx) = channel(4096);
        let session = Session::spawn(server_rx, server_tx, Role::Server, config.clone());
        let peer_writer = FrameWriter::new(peer_tx, Role::Client);
        let peer_reader = FrameReader::new(peer_rx, Role::Client, &config);
        (session, peer_writer, peer_reader)
    }

    #[tokio::test]
    async fn test_ping_answered_and_delivered() {
        let (mut session, mut peer_writer, mut peer_reader) = connected();

        peer_writer.write_frame(Frame::ping("hi")).await.unwrap();

        let ping = session.recv().await.unwrap();
        assert_eq!(ping.frame_type(), FrameType::Ping);

        let pong = peer_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(pong.frame_type(), FrameType::Pong);
        assert_eq!(&pong.payload()[..], b"hi");
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed() {
        let (mut session, mut peer_writer, mut peer_reader) = connected();

        peer_writer.write_frame(Frame::text("last")).await.unwrap();
        peer_writer
            .write_frame(Frame::close(Some(CloseReason::new(1000, "bye"))))
            .await
            .unwrap();

        assert_eq!(session.recv().await.unwrap().as_text().unwrap(), "last");
        assert_eq!(session.recv().await.unwrap().frame_type(), FrameType::Close);
        assert!(session.recv().await.is_none());

        let reason = session.closed().await;
        assert_eq!(reason, CloseReason::new(1000, "bye"));
        assert_eq!(session.closed().await, reason);

        let echo = peer_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(echo.close_reason(), Some(CloseReason::new(1000, "bye")));
        assert!(peer_reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_close_sent_once() {
        let (session, mut peer_writer, mut peer_reader) = connected();

        session.send(Frame::text("hello")).await.unwrap();
        session
            .close(Some(CloseReason::new(CloseReason::GOING_AWAY, "")))
            .await
            .unwrap();

        let text = peer_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(text.as_text().unwrap(), "hello");
        let close = peer_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(close.close_reason().unwrap().code, CloseReason::GOING_AWAY);

        // the peer's answer must not trigger a second Close
        peer_writer.write_frame(Frame::close(None)).await.unwrap();
        assert!(peer_reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_close_then_eof_reports_sent_reason() {
        let (mut session, mut peer_writer, mut peer_reader) = connected();

        session
            .close(Some(CloseReason::new(CloseReason::GOING_AWAY, "shutdown")))
            .await
            .unwrap();
        let close = peer_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(close.frame_type(), FrameType::Close);

        // the peer goes away without answering
        peer_writer.close();

        assert!(session.recv().await.is_none());
        assert_eq!(
            session.closed().await,
            CloseReason::new(CloseReason::GOING_AWAY, "shutdown")
        );
    }

    #[tokio::test]
    async fn test_abnormal_closure_on_eof() {
        let (mut session, mut peer_writer, _peer_reader) = connected();

        peer_writer.write_frame(Frame::binary(vec![1, 2])).await.unwrap();
        peer_writer.close();

        assert_eq!(session.recv().await.unwrap().len(), 2);
        assert!(session.recv().await.is_none());
        assert_eq!(session.closed().await, CloseReason::abnormal());
    }

    #[tokio::test]
    async fn test_protocol_error_closes_with_code() {
        let config = Config::default();
        let (peer_tx, server_rx) = channel(4096);
        let (server_tx, peer_rx) = channel(4096);
        let mut session = Session::spawn(server_rx, server_tx, Role::Server, config.clone());
        let mut peer_reader = FrameReader::new(peer_rx, Role::Client, &config);

        // unmasked frame sent to a server
        let mut raw = peer_tx;
        raw.write(&[0x81, 0x01, b'x']).await.unwrap();

        assert_eq!(session.closed().await, CloseReason::abnormal());
        let close = peer_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(
            close.close_reason().unwrap().code,
            CloseReason::PROTOCOL_ERROR
        );
    }
}
