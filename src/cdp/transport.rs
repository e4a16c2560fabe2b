//! CDP Transport Layer
//!
//! The byte channel between the connection and the browser. Production
//! traffic goes over a hand-rolled WebSocket client; the [`Transport`]
//! trait exists so tests can substitute an in-memory pair.

use std::io::{Read, Write};
use std::net::TcpStream;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// An inbound item produced by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete text message from the browser.
    Message(String),
    /// The transport shut down; carries a reason when one is known.
    Closed(Option<String>),
}

/// Bidirectional byte-message channel to the browser.
///
/// Outbound traffic goes through `send`; inbound traffic and closure are
/// delivered on the `mpsc` receiver handed out at construction time.
pub trait Transport: Send + Sync + 'static {
    /// Send one text message. A failure here is terminal for the connection.
    fn send(&self, text: &str) -> Result<()>;

    /// Stop the transport. Idempotent.
    fn close(&self);
}

/// WebSocket opcodes we care about
mod ws {
    pub const OPCODE_TEXT: u8 = 0x1;
    pub const OPCODE_CLOSE: u8 = 0x8;
    pub const OPCODE_PING: u8 = 0x9;
    pub const OPCODE_PONG: u8 = 0xA;
}

/// Write a masked client frame
fn write_ws_frame(stream: &mut TcpStream, opcode: u8, data: &[u8]) -> std::io::Result<()> {
    let len = data.len();
    let mut frame = Vec::with_capacity(14 + len);

    // FIN + opcode
    frame.push(0x80 | opcode);

    // Mask bit set (client must mask), then length
    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len < 65536 {
        frame.push(0x80 | 126);
        frame.push((len >> 8) as u8);
        frame.push(len as u8);
    } else {
        frame.push(0x80 | 127);
        for i in (0..8).rev() {
            frame.push((len >> (i * 8)) as u8);
        }
    }

    // Random masking key per frame (RFC 6455 compliance)
    let mask: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask);

    for (i, byte) in data.iter().enumerate() {
        frame.push(byte ^ mask[i % 4]);
    }

    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Read a frame, returns (opcode, payload)
fn read_ws_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;

    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        len = ((ext[0] as usize) << 8) | (ext[1] as usize);
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        len = 0;
        for byte in ext.iter() {
            len = (len << 8) | (*byte as usize);
        }
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m)?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((opcode, payload))
}

/// WebSocket transport to a browser's DevTools endpoint
pub struct WebSocketTransport {
    writer: Mutex<TcpStream>,
}

impl WebSocketTransport {
    /// Connect to a `ws://` DevTools URL.
    ///
    /// Returns the transport plus the receiver the connection drains for
    /// inbound messages. The reader runs on a dedicated thread and delivers
    /// strictly in receipt order.
    pub fn connect(ws_url: &str) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let url = ws_url.trim_start_matches("ws://");
        let (host_port, _path) = url.split_once('/').unwrap_or((url, ""));

        let mut stream = TcpStream::connect(host_port)
            .map_err(|e| Error::transport_io("Failed to connect to browser", e))?;

        // WebSocket handshake
        let path = format!("/{}", url.split_once('/').map(|(_, p)| p).unwrap_or(""));
        let key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            rand::random::<[u8; 16]>(),
        );

        let handshake = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            path, host_port, key
        );

        stream
            .write_all(handshake.as_bytes())
            .map_err(|e| Error::transport_io("Handshake write failed", e))?;

        let mut response = [0u8; 1024];
        let n = stream
            .read(&mut response)
            .map_err(|e| Error::transport_io("Handshake read failed", e))?;
        let response_str = String::from_utf8_lossy(&response[..n]);

        if !response_str.contains("101") {
            return Err(Error::transport(format!(
                "WebSocket handshake failed: {}",
                response_str
            )));
        }

        tracing::debug!("WebSocket connected to {}", ws_url);

        let reader_stream = stream
            .try_clone()
            .map_err(|e| Error::transport_io("Failed to clone stream", e))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            Self::reader_loop(reader_stream, event_tx);
        });

        Ok((
            Self {
                writer: Mutex::new(stream),
            },
            event_rx,
        ))
    }

    /// Reader loop - runs on its own thread so slow frames never stall tokio workers
    fn reader_loop(mut stream: TcpStream, event_tx: mpsc::UnboundedSender<TransportEvent>) {
        let reason = loop {
            let (opcode, payload) = match read_ws_frame(&mut stream) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break Some(format!("WebSocket read error: {}", e));
                }
            };

            match opcode {
                ws::OPCODE_TEXT => {
                    let text = match String::from_utf8(payload) {
                        Ok(s) => s,
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF-8 text frame");
                            continue;
                        }
                    };
                    if event_tx.send(TransportEvent::Message(text)).is_err() {
                        // Receiver gone: the connection is shutting down.
                        break None;
                    }
                }
                ws::OPCODE_PING => {
                    let frame = vec![0x80 | ws::OPCODE_PONG, 0x80, 0, 0, 0, 0];
                    let _ = stream.write_all(&frame);
                }
                ws::OPCODE_CLOSE => {
                    tracing::debug!("WebSocket closed by server");
                    break Some("WebSocket closed by server".to_string());
                }
                _ => {}
            }
        };

        let _ = event_tx.send(TransportEvent::Closed(reason));
        tracing::debug!("transport reader loop ended");
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        write_ws_frame(&mut writer, ws::OPCODE_TEXT, text.as_bytes())
            .map_err(|e| Error::transport_io("WebSocket write failed", e))
    }

    fn close(&self) {
        let mut writer = self.writer.lock();
        let close_frame = vec![0x80 | ws::OPCODE_CLOSE, 0x80, 0, 0, 0, 0];
        let _ = writer.write_all(&close_frame);
        let _ = writer.shutdown(std::net::Shutdown::Both);
    }
}
