//! Control-port transport
//!
//! Framed CRLF lines over TCP, demultiplexed into command replies and
//! asynchronous events. Replies are paired with commands strictly FIFO; the
//! protocol guarantees arrival in request order, so an unpairable reply is a
//! violation that tears the connection down.

use crate::control::command::{Event, Reply, ReplyLine};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Handle to the socket task. Cheap to clone; dropping every handle shuts
/// the task down.
#[derive(Clone)]
pub struct ControlSocket {
    req_tx: mpsc::UnboundedSender<SocketRequest>,
}

enum SocketRequest {
    Send {
        line: String,
        reply_tx: oneshot::Sender<Result<Reply>>,
    },
    RegisterEvent {
        keyword: String,
        handler: mpsc::UnboundedSender<Event>,
    },
    Shutdown,
}

impl ControlSocket {
    /// Open the TCP connection and spawn the reader/demux tasks.
    ///
    /// The returned receiver yields exactly one error when the connection
    /// dies for any reason other than an explicit [`shutdown`](Self::shutdown).
    pub async fn connect(host: &str, port: u16) -> Result<(Self, mpsc::UnboundedReceiver<Error>)> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(Error::ControlConnectFailed)?;
        debug!("control socket connected to {}:{}", host, port);

        let (read_half, write_half) = stream.into_split();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_lines(read_half, line_tx));
        tokio::spawn(run_socket(write_half, req_rx, line_rx, closed_tx));

        Ok((Self { req_tx }, closed_rx))
    }

    /// Enqueue a command (no CRLF) and await its complete reply.
    pub async fn send_command(&self, line: String) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(SocketRequest::Send { line, reply_tx })
            .map_err(|_| Error::ConnectionLost)?;
        reply_rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Route events whose first word matches `keyword` (uppercase) to `handler`.
    pub fn register_event(&self, keyword: &str, handler: mpsc::UnboundedSender<Event>) {
        let _ = self.req_tx.send(SocketRequest::RegisterEvent {
            keyword: keyword.to_ascii_uppercase(),
            handler,
        });
    }

    /// Close the connection. Pending commands complete with `ConnectionLost`;
    /// no error is reported on the closed channel.
    pub fn shutdown(&self) {
        let _ = self.req_tx.send(SocketRequest::Shutdown);
    }
}

/// Reader task: CRLF lines from the wire into the demux channel.
async fn read_lines(read_half: OwnedReadHalf, line_tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if line_tx.send(trimmed.to_string()).is_err() {
                    break;
                }
            },
        }
    }
    // Dropping line_tx signals EOF to the demux task.
}

async fn run_socket(
    mut write_half: OwnedWriteHalf,
    mut req_rx: mpsc::UnboundedReceiver<SocketRequest>,
    mut line_rx: mpsc::UnboundedReceiver<String>,
    closed_tx: mpsc::UnboundedSender<Error>,
) {
    let mut demux = Demux::new();

    let error = loop {
        tokio::select! {
            req = req_rx.recv() => match req {
                Some(SocketRequest::Send { line, reply_tx }) => {
                    trace!("control send: {}", line);
                    let wire = format!("{}\r\n", line);
                    if write_half.write_all(wire.as_bytes()).await.is_err() {
                        demux.pending.push_back(reply_tx);
                        break Some(Error::ConnectionLost);
                    }
                    demux.pending.push_back(reply_tx);
                },
                Some(SocketRequest::RegisterEvent { keyword, handler }) => {
                    demux.handlers.insert(keyword, handler);
                },
                Some(SocketRequest::Shutdown) | None => break None,
            },
            line = line_rx.recv() => match line {
                Some(line) => {
                    trace!("control recv: {}", line);
                    if let Err(e) = demux.feed_line(&line) {
                        break Some(e);
                    }
                },
                None => break Some(Error::ConnectionLost),
            },
        }
    };

    demux.fail_all_pending();
    if let Some(e) = error {
        warn!("control socket closed: {}", e);
        let _ = closed_tx.send(e);
    }
    let _ = write_half.shutdown().await;
}

/// Per-line protocol state, factored out of the task for testability.
struct Demux {
    pending: VecDeque<oneshot::Sender<Result<Reply>>>,
    handlers: HashMap<String, mpsc::UnboundedSender<Event>>,
    block: Option<Block>,
}

/// A reply or event being accumulated across continuation lines.
struct Block {
    is_event: bool,
    lines: Vec<ReplyLine>,
    in_data: bool,
}

impl Demux {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            handlers: HashMap::new(),
            block: None,
        }
    }

    fn feed_line(&mut self, line: &str) -> Result<()> {
        // Raw data-block content is consumed verbatim until the dot line.
        if let Some(block) = self.block.as_mut() {
            if block.in_data {
                if line == "." {
                    block.in_data = false;
                } else {
                    let unstuffed = line.strip_prefix('.').filter(|_| line.starts_with("..")).unwrap_or(line);
                    block
                        .lines
                        .last_mut()
                        .and_then(|l| l.data.as_mut())
                        .expect("data block without opening line")
                        .push(unstuffed.to_string());
                }
                return Ok(());
            }
        }

        let (status, sep, text) = parse_status_line(line)?;

        if self.block.is_none() {
            let is_event = (600..700).contains(&status);
            if !is_event && self.pending.is_empty() {
                return Err(Error::ProtocolViolation(format!(
                    "unsolicited reply line: {}",
                    line
                )));
            }
            self.block = Some(Block {
                is_event,
                lines: Vec::new(),
                in_data: false,
            });
        }
        let block = self.block.as_mut().expect("block ensured above");

        block.lines.push(ReplyLine {
            status,
            text: text.to_string(),
            data: (sep == '+').then(Vec::new),
        });

        match sep {
            '-' => {},
            '+' => block.in_data = true,
            ' ' => {
                let block = self.block.take().expect("finalizing without a block");
                self.dispatch(status, block)?;
            },
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown separator {:?} in line: {}",
                    other, line
                )))
            },
        }
        Ok(())
    }

    fn dispatch(&mut self, status: u16, block: Block) -> Result<()> {
        if block.is_event {
            let mut lines = Vec::new();
            for l in block.lines {
                lines.push(l.text);
                if let Some(data) = l.data {
                    lines.extend(data);
                }
            }
            let keyword = lines
                .first()
                .and_then(|l| l.split_whitespace().next())
                .unwrap_or("")
                .to_ascii_uppercase();
            if keyword.is_empty() {
                return Err(Error::ProtocolViolation("event with empty payload".into()));
            }
            match self.handlers.get(&keyword) {
                Some(handler) => {
                    let _ = handler.send(Event { keyword, lines });
                },
                None => debug!("unrouted {} event dropped", keyword),
            }
            Ok(())
        } else {
            let reply_tx = self.pending.pop_front().ok_or_else(|| {
                Error::ProtocolViolation("reply completed with no pending command".into())
            })?;
            let _ = reply_tx.send(Ok(Reply {
                status,
                lines: block.lines,
            }));
            Ok(())
        }
    }

    fn fail_all_pending(&mut self) {
        for tx in self.pending.drain(..) {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
    }
}

fn parse_status_line(line: &str) -> Result<(u16, char, &str)> {
    let violation = || Error::ProtocolViolation(format!("malformed reply line: {:?}", line));

    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) || !bytes[3].is_ascii() {
        return Err(violation());
    }
    let status: u16 = line[..3].parse().map_err(|_| violation())?;
    Ok((status, bytes[3] as char, &line[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cmd(demux: &mut Demux) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        demux.pending.push_back(tx);
        rx
    }

    #[test]
    fn multi_line_reply_accumulates() {
        let mut demux = Demux::new();
        let mut rx = push_cmd(&mut demux);

        demux.feed_line("250-k=v1").unwrap();
        demux.feed_line("250-k=v2").unwrap();
        assert!(rx.try_recv().is_err());
        demux.feed_line("250 OK").unwrap();

        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.status, 250);
        let texts: Vec<_> = reply.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["k=v1", "k=v2", "OK"]);
    }

    #[test]
    fn data_block_collected_verbatim() {
        let mut demux = Demux::new();
        let mut rx = push_cmd(&mut demux);

        demux.feed_line("250+config-text=").unwrap();
        demux.feed_line("SocksPort auto").unwrap();
        demux.feed_line("..leading-dot").unwrap();
        demux.feed_line(".").unwrap();
        demux.feed_line("250 OK").unwrap();

        let reply = rx.try_recv().unwrap().unwrap();
        let data = reply.lines[0].data.as_ref().unwrap();
        assert_eq!(data, &vec!["SocksPort auto".to_string(), ".leading-dot".to_string()]);
    }

    #[test]
    fn events_interleave_without_consuming_replies() {
        let mut demux = Demux::new();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        demux.handlers.insert("STATUS_CLIENT".into(), ev_tx);
        let mut rx = push_cmd(&mut demux);

        demux.feed_line("250-k=v").unwrap();
        demux
            .feed_line("650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED")
            .unwrap();
        demux.feed_line("250 OK").unwrap();

        let ev = ev_rx.try_recv().unwrap();
        assert_eq!(ev.keyword, "STATUS_CLIENT");
        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.lines[0].text, "k=v");
    }

    #[test]
    fn unsolicited_reply_is_violation() {
        let mut demux = Demux::new();
        assert!(matches!(
            demux.feed_line("250 OK"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn malformed_lines_are_violations() {
        let mut demux = Demux::new();
        push_cmd(&mut demux);
        assert!(matches!(demux.feed_line("25"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(demux.feed_line("abc def"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(demux.feed_line("250?bad"), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn teardown_fails_pending() {
        let mut demux = Demux::new();
        let mut rx1 = push_cmd(&mut demux);
        let mut rx2 = push_cmd(&mut demux);
        demux.fail_all_pending();
        assert!(matches!(rx1.try_recv().unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(Error::ConnectionLost)));
    }
}
