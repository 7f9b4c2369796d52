use std::borrow::Cow;

use bytes::Bytes;
use guestrpc_message::{Channel, ChannelConfig};
use guestrpc_transport::{Backdoor, Transport};
use tracing::debug;

use crate::error::{Result, RpciError};
use crate::RPCI_PROTOCOL;

const OK_PREFIX: &[u8] = b"1";
const FAILED_PREFIX: &[u8] = b"0";

/// A parsed RPCI reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpciReply {
    /// Whether the host reported success.
    pub ok: bool,
    /// Reply text after the status prefix.
    pub body: Bytes,
}

impl RpciReply {
    /// Parse a raw reply: `1` or `0`, optionally followed by a space and the
    /// body.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (ok, rest) = if let Some(rest) = raw.strip_prefix(OK_PREFIX) {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix(FAILED_PREFIX) {
            (false, rest)
        } else {
            return Err(RpciError::Malformed(
                String::from_utf8_lossy(raw).into_owned(),
            ));
        };

        let body = match rest {
            [] => &[][..],
            [b' ', body @ ..] => body,
            _ => {
                return Err(RpciError::Malformed(
                    String::from_utf8_lossy(raw).into_owned(),
                ))
            }
        };

        Ok(Self {
            ok,
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// An RPCI session on one open channel.
#[derive(Debug)]
pub struct RpciClient<B: Backdoor + ?Sized> {
    channel: Channel<B>,
}

impl<B: Backdoor + ?Sized> RpciClient<B> {
    /// Open an RPCI channel with default configuration.
    pub fn open(transport: Transport<B>) -> Result<Self> {
        Self::open_with_config(transport, ChannelConfig::default())
    }

    pub fn open_with_config(transport: Transport<B>, config: ChannelConfig) -> Result<Self> {
        let channel = Channel::open_with_config(transport, RPCI_PROTOCOL, config)?;
        Ok(Self { channel })
    }

    /// Send `command` and return the host's reply.
    pub fn call(&mut self, command: impl AsRef<[u8]>) -> Result<RpciReply> {
        let command = command.as_ref();
        self.channel.send(command)?;

        let raw = self.channel.receive()?;
        if raw.is_empty() {
            return Err(RpciError::NoReply);
        }
        let reply = RpciReply::parse(raw)?;
        debug!(
            channel = self.channel.id(),
            ok = reply.ok,
            len = reply.body.len(),
            "rpci reply"
        );
        Ok(reply)
    }

    pub fn channel(&self) -> &Channel<B> {
        &self.channel
    }

    /// Close the underlying channel.
    pub fn close(self) -> Result<()> {
        self.channel.close()?;
        Ok(())
    }
}

/// Open a channel, run one command, and close again.
pub fn send_one<B: Backdoor + ?Sized>(
    transport: &Transport<B>,
    command: impl AsRef<[u8]>,
) -> Result<RpciReply> {
    send_one_with_config(transport, command, ChannelConfig::default())
}

pub fn send_one_with_config<B: Backdoor + ?Sized>(
    transport: &Transport<B>,
    command: impl AsRef<[u8]>,
    config: ChannelConfig,
) -> Result<RpciReply> {
    let mut client = RpciClient::open_with_config(transport.clone(), config)?;
    let reply = client.call(command)?;
    // The reply is in hand; a refused close does not fail the call.
    if let Err(err) = client.close() {
        debug!(%err, "closing rpci channel failed");
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use guestrpc_message::sim::{Fault, SimulatedHost, Step};
    use guestrpc_message::{MessageError, MessageType};

    use super::*;

    fn echo_host() -> Transport<SimulatedHost> {
        let mut host = SimulatedHost::new();
        host.set_responder(|protocol, msg| {
            assert_eq!(protocol, RPCI_PROTOCOL);
            Some([&b"1 "[..], msg].concat())
        });
        Transport::new(host)
    }

    #[test]
    fn parse_reply_variants() {
        let ok = RpciReply::parse(b"1 hello world").expect("ok reply should parse");
        assert!(ok.ok);
        assert_eq!(ok.body.as_ref(), b"hello world");

        let failed = RpciReply::parse(b"0 No value found").expect("failure should parse");
        assert!(!failed.ok);
        assert_eq!(failed.text(), "No value found");

        let bare = RpciReply::parse(b"1").expect("bare status should parse");
        assert!(bare.ok);
        assert!(bare.body.is_empty());
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        assert!(matches!(
            RpciReply::parse(b"yes"),
            Err(RpciError::Malformed(raw)) if raw == "yes"
        ));
        assert!(matches!(
            RpciReply::parse(b"10"),
            Err(RpciError::Malformed(_))
        ));
    }

    #[test]
    fn call_round_trips_through_channel() {
        let transport = echo_host();
        let mut client = RpciClient::open(transport.clone()).expect("client should open");

        let reply = client.call("log hello").expect("call should succeed");
        assert!(reply.ok);
        assert_eq!(reply.text(), "log hello");

        let id = client.channel().id();
        assert_eq!(transport.lock().protocol(id), Some(RPCI_PROTOCOL));
        client.close().expect("close should succeed");
        assert!(transport.lock().open_channels().is_empty());
    }

    #[test]
    fn call_without_reply_is_no_reply() {
        let transport = Transport::new(SimulatedHost::new());
        let mut client = RpciClient::open(transport).expect("client should open");
        assert!(matches!(client.call("ping"), Err(RpciError::NoReply)));
    }

    #[test]
    fn send_one_closes_channel() {
        let transport = echo_host();
        let reply = send_one(&transport, "tools.set.version 0").expect("send_one should succeed");
        assert!(reply.ok);
        assert!(transport.lock().open_channels().is_empty());
    }

    #[test]
    fn send_one_survives_checkpoint() {
        let transport = echo_host();
        transport
            .lock()
            .inject_checkpoint(Step::Message(MessageType::ReceivePayload));

        let reply = send_one(&transport, "abcdefgh").expect("send_one should retry");
        assert_eq!(reply.body.as_ref(), b"abcdefgh");
    }

    #[test]
    fn open_refusal_surfaces_as_message_error() {
        let transport = echo_host();
        transport.lock().inject(Step::Open, 1, Fault::Reject);
        transport.lock().inject(Step::Open, 1, Fault::Reject);

        let err = send_one(&transport, "x").expect_err("open should be refused");
        assert!(matches!(
            err,
            RpciError::Message(MessageError::OpenRefused {
                protocol: RPCI_PROTOCOL
            })
        ));
    }
}
