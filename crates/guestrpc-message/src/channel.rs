use std::fmt;

use guestrpc_transport::{Backdoor, Registers, Transport};
use tracing::{debug, trace, warn};

use crate::config::{ChannelConfig, RetryPolicy};
use crate::error::{MessageError, Operation, Result};
use crate::protocol::{
    basic_request, bulk_receive_request, bulk_send_request, bulk_status, open_request,
    pack_word, reply_cookie, reply_id, reply_size, reply_status, reply_type, unpack_word,
    Cookie, MessageStatus, MessageType, OpenFlags,
};

/// Outcome of one attempt at a multi-exchange operation.
enum Attempt<T> {
    Done(T),
    /// A checkpoint interrupted the attempt; start over.
    Restart,
}

/// An open message channel to the counterpart.
///
/// Each operation holds the transport lock from its first exchange to its
/// last, so channels sharing a [`Transport`] never interleave exchanges.
/// Operations take `&mut self`: one operation in flight per channel.
pub struct Channel<B: Backdoor + ?Sized> {
    transport: Transport<B>,
    id: u16,
    cookie: Cookie,
    protocol: u32,
    config: ChannelConfig,
    /// Receive buffer. Its length is the allocated size and only grows.
    buf: Vec<u8>,
    open: bool,
}

impl<B: Backdoor + ?Sized> Channel<B> {
    /// Open a channel for `protocol` with default configuration.
    pub fn open(transport: Transport<B>, protocol: u32) -> Result<Self> {
        Self::open_with_config(transport, protocol, ChannelConfig::default())
    }

    /// Open a channel for `protocol`.
    ///
    /// Cookies are requested unless disabled in `config`. A counterpart that
    /// predates cookies refuses the flag; the request is then repeated once
    /// without it.
    pub fn open_with_config(
        transport: Transport<B>,
        protocol: u32,
        config: ChannelConfig,
    ) -> Result<Self> {
        let mut flags = if config.request_cookie {
            OpenFlags::COOKIE
        } else {
            OpenFlags::empty()
        };

        let (id, cookie) = {
            let mut backdoor = transport.lock();
            with_retry(config.retry, Operation::Open, || loop {
                let out = backdoor.exchange(open_request(protocol, flags));
                let status = reply_status(&out);
                if status.is_success() {
                    return Ok(Attempt::Done((reply_id(&out), reply_cookie(&out))));
                }
                if status.is_checkpoint() {
                    return Ok(Attempt::Restart);
                }
                if !flags.is_empty() {
                    debug!(protocol, "cookies not supported, opening without");
                    flags = OpenFlags::empty();
                    continue;
                }
                warn!(protocol, ?status, "unable to open a communication channel");
                return Err(MessageError::OpenRefused { protocol });
            })?
        };

        debug!(channel = id, protocol, cookie = %cookie, "opened channel");
        Ok(Self {
            transport,
            id,
            cookie,
            protocol,
            config,
            buf: Vec::new(),
            open: true,
        })
    }

    /// Channel id assigned by the counterpart.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Session cookie assigned by the counterpart (zero without cookies).
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Protocol tag the channel was opened with.
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Allocated size of the receive buffer.
    pub fn receive_capacity(&self) -> usize {
        self.buf.len()
    }

    /// Send one message.
    ///
    /// An error means the counterpart discarded the message. The channel
    /// stays open and the caller may send again.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let (id, cookie) = (self.id, self.cookie);
        let low_bandwidth_only = self.config.low_bandwidth_only;
        let mut backdoor = self.transport.lock();

        with_retry(self.config.retry, Operation::Send, || {
            send_once(&mut *backdoor, id, cookie, low_bandwidth_only, payload)
        })
    }

    /// Fetch the pending message, if any.
    ///
    /// Returns an empty slice when nothing is pending; this is a poll, not a
    /// wait. The slice borrows the receive buffer, which holds a NUL byte
    /// just past the message for consumers that want a C string.
    pub fn receive(&mut self) -> Result<&[u8]> {
        let (id, cookie) = (self.id, self.cookie);
        let low_bandwidth_only = self.config.low_bandwidth_only;
        let limit = self.config.receive_limit;

        let len = {
            let mut backdoor = self.transport.lock();
            let buf = &mut self.buf;
            with_retry(self.config.retry, Operation::Receive, || {
                receive_once(&mut *backdoor, id, cookie, low_bandwidth_only, limit, buf)
            })?
        };

        Ok(&self.buf[..len])
    }

    /// Close the channel.
    ///
    /// The channel is gone afterwards whatever the outcome; an error only
    /// means the counterpart did not acknowledge, and callers should treat it
    /// as closed anyway.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.open = false;
        let out = self
            .transport
            .lock()
            .exchange(basic_request(MessageType::Close, self.id, self.cookie, 0));
        self.buf = Vec::new();

        let status = reply_status(&out);
        if !status.is_success() {
            warn!(channel = self.id, ?status, "unable to close the communication channel");
            return Err(MessageError::Rejected {
                op: Operation::Close,
                channel: self.id,
                status,
            });
        }

        debug!(channel = self.id, "closed channel");
        Ok(())
    }
}

impl<B: Backdoor + ?Sized> Drop for Channel<B> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.shutdown();
        }
    }
}

impl<B: Backdoor + ?Sized> fmt::Debug for Channel<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("protocol", &format_args!("{:#x}", self.protocol))
            .field("receive_capacity", &self.buf.len())
            .finish()
    }
}

/// Run `attempt` until it completes, restarting after each checkpoint.
fn with_retry<T>(
    policy: RetryPolicy,
    op: Operation,
    mut attempt: impl FnMut() -> Result<Attempt<T>>,
) -> Result<T> {
    let mut attempts = 1u32;
    loop {
        if !policy.allows(attempts) {
            return Err(MessageError::RetryLimit {
                op,
                attempts: attempts - 1,
            });
        }
        match attempt()? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Restart => {
                debug!(%op, attempt = attempts, "a checkpoint occurred, retrying the operation");
                attempts = attempts.saturating_add(1);
            }
        }
    }
}

/// `None` to proceed, `Some(Restart)` after a checkpoint, or the rejection.
fn check<T>(
    op: Operation,
    channel: u16,
    status: MessageStatus,
) -> Result<Option<Attempt<T>>> {
    if status.is_success() {
        return Ok(None);
    }
    if status.is_checkpoint() {
        return Ok(Some(Attempt::Restart));
    }
    warn!(%op, channel, ?status, "request rejected by the counterpart");
    Err(MessageError::Rejected { op, channel, status })
}

fn send_once<B: Backdoor + ?Sized>(
    backdoor: &mut B,
    id: u16,
    cookie: Cookie,
    low_bandwidth_only: bool,
    payload: &[u8],
) -> Result<Attempt<()>> {
    let out = backdoor.exchange(basic_request(
        MessageType::SendSize,
        id,
        cookie,
        payload.len() as u64,
    ));
    let status = reply_status(&out);
    if let Some(restart) = check(Operation::Send, id, status)? {
        return Ok(restart);
    }

    if payload.is_empty() {
        return Ok(Attempt::Done(()));
    }

    if status.high_bandwidth() && !low_bandwidth_only {
        trace!(channel = id, len = payload.len(), "sending in one bulk copy");
        let out = backdoor.bulk_send(bulk_send_request(id, cookie), payload);
        if let Some(restart) = check(Operation::Send, id, bulk_status(&out))? {
            return Ok(restart);
        }
        return Ok(Attempt::Done(()));
    }

    trace!(channel = id, len = payload.len(), "sending word by word");
    for chunk in payload.chunks(4) {
        let word = pack_word(chunk);
        let out = backdoor.exchange(basic_request(
            MessageType::SendPayload,
            id,
            cookie,
            u64::from(word),
        ));
        if let Some(restart) = check(Operation::Send, id, reply_status(&out))? {
            return Ok(restart);
        }
    }

    Ok(Attempt::Done(()))
}

fn receive_once<B: Backdoor + ?Sized>(
    backdoor: &mut B,
    id: u16,
    cookie: Cookie,
    low_bandwidth_only: bool,
    limit: Option<usize>,
    buf: &mut Vec<u8>,
) -> Result<Attempt<usize>> {
    let poll = backdoor.exchange(basic_request(MessageType::ReceiveSize, id, cookie, 0));
    let status = reply_status(&poll);
    if let Some(restart) = check(Operation::Receive, id, status)? {
        return Ok(restart);
    }

    if !status.contains(MessageStatus::DO_RECEIVE) {
        trace!(channel = id, "no message to retrieve");
        return Ok(Attempt::Done(0));
    }

    let high_bandwidth = status.high_bandwidth() && !low_bandwidth_only;
    let mut outstanding = 0usize;
    let result = announced_size(&poll, id).and_then(|size| {
        outstanding = size;
        reserve_receive_buffer(buf, size, limit, id)?;
        receive_payload(&mut *backdoor, id, cookie, high_bandwidth, size, buf, &mut outstanding)
    });

    if result.is_err() {
        signal_failure(backdoor, id, cookie, outstanding);
    }
    result
}

/// Size of the message announced by a successful poll.
fn announced_size(poll: &Registers, id: u16) -> Result<usize> {
    let announced = reply_type(poll);
    if announced != MessageType::SendSize as u16 {
        warn!(channel = id, announced, "expected a SENDSIZE request from the counterpart");
        return Err(MessageError::Protocol {
            op: Operation::Receive,
            channel: id,
            expected: MessageType::SendSize,
            actual: announced,
        });
    }
    Ok(reply_size(poll))
}

/// Pull an announced message of `size` bytes into `buf` and acknowledge it.
///
/// `buf` already holds `size + 1` bytes. `outstanding` tracks payload bytes
/// not yet received, so a failure can be reported against the right step.
fn receive_payload<B: Backdoor + ?Sized>(
    backdoor: &mut B,
    id: u16,
    cookie: Cookie,
    high_bandwidth: bool,
    size: usize,
    buf: &mut [u8],
    outstanding: &mut usize,
) -> Result<Attempt<usize>> {
    if size > 0 && high_bandwidth {
        trace!(channel = id, len = size, "receiving in one bulk copy");
        let out = backdoor.bulk_receive(bulk_receive_request(id, cookie), &mut buf[..size]);
        if let Some(restart) = check(Operation::Receive, id, bulk_status(&out))? {
            return Ok(restart);
        }
        *outstanding = 0;
    } else {
        let mut offset = 0usize;
        while offset < size {
            let out = backdoor.exchange(basic_request(
                MessageType::ReceivePayload,
                id,
                cookie,
                u64::from(MessageStatus::SUCCESS.bits()),
            ));
            if let Some(restart) = check(Operation::Receive, id, reply_status(&out))? {
                return Ok(restart);
            }

            let ty = reply_type(&out);
            if ty != MessageType::SendPayload as u16 {
                warn!(channel = id, ty, "expected a SENDPAYLOAD from the counterpart");
                return Err(MessageError::Protocol {
                    op: Operation::Receive,
                    channel: id,
                    expected: MessageType::SendPayload,
                    actual: ty,
                });
            }

            let take = (size - offset).min(4);
            unpack_word(out.bx.word(), &mut buf[offset..offset + take]);
            offset += take;
            *outstanding = size - offset;
        }
    }

    buf[size] = 0;

    let out = backdoor.exchange(basic_request(
        MessageType::ReceiveStatus,
        id,
        cookie,
        u64::from(MessageStatus::SUCCESS.bits()),
    ));
    if let Some(restart) = check(Operation::Receive, id, reply_status(&out))? {
        return Ok(restart);
    }

    trace!(channel = id, len = size, "received message");
    Ok(Attempt::Done(size))
}

/// Grow `buf` to hold `size` bytes plus a trailing NUL. Never shrinks.
fn reserve_receive_buffer(
    buf: &mut Vec<u8>,
    size: usize,
    limit: Option<usize>,
    channel: u16,
) -> Result<()> {
    let needed = size
        .checked_add(1)
        .filter(|_| limit.is_none_or(|max| size <= max))
        .ok_or(MessageError::OutOfMemory { channel, size })?;
    if needed > buf.len() {
        buf.try_reserve_exact(needed - buf.len())
            .map_err(|_| MessageError::OutOfMemory { channel, size })?;
        buf.resize(needed, 0);
    }
    Ok(())
}

/// Tell the counterpart the announced message was not received, so it does
/// not count it as consumed. Best effort.
fn signal_failure<B: Backdoor + ?Sized>(
    backdoor: &mut B,
    id: u16,
    cookie: Cookie,
    outstanding: usize,
) {
    let ty = if outstanding == 0 {
        MessageType::ReceiveStatus
    } else {
        MessageType::ReceivePayload
    };
    let out = backdoor.exchange(basic_request(
        ty,
        id,
        cookie,
        u64::from(MessageStatus::FAILURE.bits()),
    ));
    if !reply_status(&out).is_success() {
        warn!(channel = id, "unable to signal an error of reception");
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;
    use crate::sim::{Fault, SimulatedHost, Step};

    const PROTO: u32 = 0x1234;

    fn host() -> Transport<SimulatedHost> {
        Transport::new(SimulatedHost::new())
    }

    fn host_with_bandwidth(high_bandwidth: bool) -> Transport<SimulatedHost> {
        let transport = host();
        transport.lock().set_high_bandwidth(high_bandwidth);
        transport
    }

    fn roundtrip(transport: &Transport<SimulatedHost>, payload: &[u8]) {
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();

        chan.send(payload).unwrap();
        let delivered = transport.lock().delivered(id).to_vec();
        assert_eq!(delivered, vec![payload.to_vec()]);

        transport.lock().queue_message(id, payload.to_vec());
        let received = chan.receive().unwrap().to_vec();
        assert_eq!(received, payload);
        assert_eq!(transport.lock().pending(id), 0);
        chan.close().unwrap();
    }

    #[test]
    fn concrete_scenario() {
        let transport = host();
        transport
            .lock()
            .assign_next(3, Cookie::new(0xAAAA, 0xBBBB));

        let mut chan = Channel::open(transport.clone(), 0x1234).unwrap();
        assert_eq!(chan.id(), 3);
        assert_eq!(chan.cookie(), Cookie::new(0xAAAA, 0xBBBB));

        chan.send(b"ping").unwrap();
        assert_eq!(transport.lock().delivered(3), &[b"ping".to_vec()]);

        transport.lock().queue_message(3, b"pong".to_vec());
        assert_eq!(chan.receive().unwrap(), b"pong");

        chan.close().unwrap();
        assert!(!transport.lock().is_open(3));
    }

    #[test]
    fn roundtrip_word_path() {
        let transport = host_with_bandwidth(false);
        for payload in [&b""[..], b"x", b"hello, world", &[0u8, 255, 1, 254, 7]] {
            roundtrip(&transport, payload);
        }
    }

    #[test]
    fn roundtrip_bulk_path() {
        let transport = host_with_bandwidth(true);
        let large = (0..10_000u32).map(|i| i as u8).collect::<Vec<_>>();
        for payload in [&b""[..], b"x", b"hello, world", large.as_slice()] {
            roundtrip(&transport, payload);
        }
    }

    #[test]
    fn partial_word_lengths() {
        for high_bandwidth in [false, true] {
            let transport = host_with_bandwidth(high_bandwidth);
            for len in 0..=5usize {
                let payload: Vec<u8> = (1..=len as u8).collect();
                roundtrip(&transport, &payload);
            }
        }
    }

    #[test]
    fn word_path_exchange_counts() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport.lock().clear_steps();

        chan.send(b"12345").unwrap();
        let steps = transport.lock().steps().to_vec();
        assert_eq!(
            steps,
            vec![
                Step::Message(MessageType::SendSize),
                Step::Message(MessageType::SendPayload),
                Step::Message(MessageType::SendPayload),
            ]
        );
    }

    #[test]
    fn bulk_path_uses_single_copy() {
        let transport = host_with_bandwidth(true);
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport.lock().clear_steps();

        chan.send(&[7u8; 4096]).unwrap();
        assert_eq!(
            transport.lock().steps(),
            &[Step::Message(MessageType::SendSize), Step::BulkSend]
        );
    }

    #[test]
    fn low_bandwidth_only_ignores_advertised_bulk() {
        let transport = host_with_bandwidth(true);
        let config = ChannelConfig {
            low_bandwidth_only: true,
            ..ChannelConfig::default()
        };
        let mut chan = Channel::open_with_config(transport.clone(), PROTO, config).unwrap();
        transport.lock().clear_steps();

        chan.send(b"abcd").unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, b"efgh".to_vec());
        assert_eq!(chan.receive().unwrap(), b"efgh");

        let steps = transport.lock().steps().to_vec();
        assert!(!steps.contains(&Step::BulkSend));
        assert!(!steps.contains(&Step::BulkReceive));
    }

    #[test]
    fn bandwidth_is_observed_per_call() {
        let transport = host_with_bandwidth(true);
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();

        chan.send(b"first").unwrap();
        transport.lock().set_high_bandwidth(false);
        transport.lock().clear_steps();
        chan.send(b"second").unwrap();

        assert!(!transport.lock().steps().contains(&Step::BulkSend));
        assert_eq!(
            transport.lock().delivered(chan.id()),
            &[b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn receive_without_pending_message_is_empty_success() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        assert!(chan.receive().unwrap().is_empty());
        assert_eq!(transport.lock().failures_signalled(), 0);
    }

    #[test]
    fn receive_buffer_only_grows() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();

        transport.lock().queue_message(id, vec![1u8; 100]);
        assert_eq!(chan.receive().unwrap().len(), 100);
        assert_eq!(chan.receive_capacity(), 101);

        transport.lock().queue_message(id, vec![2u8; 10]);
        assert_eq!(chan.receive().unwrap(), &[2u8; 10]);
        assert_eq!(chan.receive_capacity(), 101);
    }

    #[test]
    fn received_message_is_nul_terminated() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();

        transport.lock().queue_message(id, vec![0xFFu8; 16]);
        chan.receive().unwrap();
        transport.lock().queue_message(id, b"abc".to_vec());
        chan.receive().unwrap();

        assert_eq!(&chan.buf[..4], b"abc\0");
    }

    #[test]
    fn cookie_fallback_on_old_counterpart() {
        let transport = host();
        transport.lock().set_cookies_supported(false);

        let chan = Channel::open(transport.clone(), PROTO).unwrap();
        assert!(transport.lock().is_open(chan.id()));
        assert_eq!(chan.cookie(), Cookie::default());
        assert_eq!(
            transport.lock().steps(),
            &[Step::Open, Step::Open],
            "exactly one retry without the cookie flag"
        );
    }

    #[test]
    fn open_refused_after_fallback() {
        let transport = host();
        transport.lock().inject(Step::Open, 1, Fault::Reject);
        transport.lock().inject(Step::Open, 1, Fault::Reject);

        let err = Channel::open(transport.clone(), PROTO).unwrap_err();
        assert!(matches!(err, MessageError::OpenRefused { protocol: PROTO }));
        assert_eq!(transport.lock().steps().len(), 2);
        assert!(transport.lock().open_channels().is_empty());
    }

    #[test]
    fn open_refused_when_no_slots() {
        let transport = host();
        let _chans: Vec<_> = (0..crate::MAX_CHANNELS)
            .map(|_| Channel::open(transport.clone(), PROTO).unwrap())
            .collect();

        let err = Channel::open(transport.clone(), PROTO).unwrap_err();
        assert!(matches!(err, MessageError::OpenRefused { .. }));
    }

    #[test]
    fn stale_cookie_is_rejected() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();
        transport.lock().rotate_cookie(id, Cookie::new(1, 2));

        let err = chan.send(b"hello").unwrap_err();
        assert!(matches!(
            err,
            MessageError::Rejected {
                op: Operation::Send,
                ..
            }
        ));

        let err = chan.receive().unwrap_err();
        assert!(matches!(
            err,
            MessageError::Rejected {
                op: Operation::Receive,
                ..
            }
        ));
        assert!(transport.lock().delivered(id).is_empty());
    }

    #[test]
    fn forgotten_channel_is_rejected() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport.lock().forget_channel(chan.id());

        assert!(chan.send(b"x").is_err());
        assert!(chan.close().is_err());
    }

    #[test]
    fn checkpoint_at_each_send_step_retries_once() {
        let steps = [
            (false, Step::Message(MessageType::SendSize), 1),
            (false, Step::Message(MessageType::SendPayload), 1),
            (false, Step::Message(MessageType::SendPayload), 2),
            (true, Step::Message(MessageType::SendSize), 1),
            (true, Step::BulkSend, 1),
        ];

        for (high_bandwidth, step, occurrence) in steps {
            let transport = host_with_bandwidth(high_bandwidth);
            let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
            let id = chan.id();
            transport.lock().clear_steps();
            transport
                .lock()
                .inject(step, occurrence, Fault::Checkpoint);

            chan.send(b"checkpointed").unwrap();

            let host = transport.lock();
            assert_eq!(host.delivered(id), &[b"checkpointed".to_vec()], "{step:?}");
            let restarts = host
                .steps()
                .iter()
                .filter(|s| **s == Step::Message(MessageType::SendSize))
                .count();
            assert_eq!(restarts, 2, "{step:?}");
        }
    }

    #[test]
    fn checkpoint_at_each_receive_step_retries_once() {
        let steps = [
            (false, Step::Message(MessageType::ReceiveSize), 1),
            (false, Step::Message(MessageType::ReceivePayload), 1),
            (false, Step::Message(MessageType::ReceivePayload), 2),
            (false, Step::Message(MessageType::ReceiveStatus), 1),
            (true, Step::BulkReceive, 1),
            (true, Step::Message(MessageType::ReceiveStatus), 1),
        ];

        for (high_bandwidth, step, occurrence) in steps {
            let transport = host_with_bandwidth(high_bandwidth);
            let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
            let id = chan.id();
            transport.lock().queue_message(id, b"reply body".to_vec());
            transport.lock().clear_steps();
            transport
                .lock()
                .inject(step, occurrence, Fault::Checkpoint);

            assert_eq!(chan.receive().unwrap(), b"reply body", "{step:?}");

            let host = transport.lock();
            assert_eq!(host.pending(id), 0, "{step:?}");
            assert_eq!(host.failures_signalled(), 0, "{step:?}");
            let polls = host
                .steps()
                .iter()
                .filter(|s| **s == Step::Message(MessageType::ReceiveSize))
                .count();
            assert_eq!(polls, 2, "{step:?}");
        }
    }

    #[test]
    fn checkpoint_during_open_retries_with_same_flags() {
        let transport = host();
        transport.lock().inject_checkpoint(Step::Open);

        let chan = Channel::open(transport.clone(), PROTO).unwrap();
        assert_ne!(chan.cookie(), Cookie::default());
        assert_eq!(transport.lock().steps(), &[Step::Open, Step::Open]);
    }

    #[test]
    fn checkpoint_does_not_leak_into_next_operation() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport
            .lock()
            .inject_checkpoint(Step::Message(MessageType::SendPayload));

        chan.send(b"one").unwrap();
        transport.lock().clear_steps();
        chan.send(b"two").unwrap();

        assert_eq!(transport.lock().steps().len(), 2);
    }

    #[test]
    fn retry_bound_surfaces_error() {
        let transport = host();
        let config = ChannelConfig {
            retry: RetryPolicy::bounded(NonZeroU32::new(3).unwrap()),
            ..ChannelConfig::default()
        };
        let mut chan = Channel::open_with_config(transport.clone(), PROTO, config).unwrap();
        for _ in 0..3 {
            transport
                .lock()
                .inject_checkpoint(Step::Message(MessageType::SendSize));
        }

        let err = chan.send(b"never").unwrap_err();
        assert!(matches!(
            err,
            MessageError::RetryLimit {
                op: Operation::Send,
                attempts: 3
            }
        ));
        assert!(transport.lock().delivered(chan.id()).is_empty());
    }

    #[test]
    fn rejected_send_leaves_channel_usable() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport.lock().inject(
            Step::Message(MessageType::SendPayload),
            1,
            Fault::Reject,
        );

        assert!(chan.send(b"lost").is_err());
        chan.send(b"kept").unwrap();
        assert_eq!(transport.lock().delivered(chan.id()), &[b"kept".to_vec()]);
    }

    #[test]
    fn receive_payload_failure_is_signalled() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, b"retry me".to_vec());
        transport.lock().inject(
            Step::Message(MessageType::ReceivePayload),
            2,
            Fault::Reject,
        );
        transport.lock().clear_steps();

        assert!(chan.receive().is_err());
        {
            let host = transport.lock();
            assert_eq!(host.failures_signalled(), 1);
            assert_eq!(host.pending(id), 1);
            assert_eq!(
                host.steps().last(),
                Some(&Step::Message(MessageType::ReceivePayload))
            );
        }

        assert_eq!(chan.receive().unwrap(), b"retry me");
    }

    #[test]
    fn protocol_violation_is_signalled() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, b"abc".to_vec());
        transport.lock().inject(
            Step::Message(MessageType::ReceiveSize),
            1,
            Fault::WrongType,
        );

        let err = chan.receive().unwrap_err();
        assert!(matches!(
            err,
            MessageError::Protocol {
                expected: MessageType::SendSize,
                ..
            }
        ));
        assert_eq!(transport.lock().failures_signalled(), 1);
        assert_eq!(
            transport.lock().steps().last(),
            Some(&Step::Message(MessageType::ReceiveStatus))
        );
        assert_eq!(chan.receive().unwrap(), b"abc");
    }

    #[test]
    fn wrong_payload_type_is_protocol_error() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, b"abcdef".to_vec());
        transport.lock().inject(
            Step::Message(MessageType::ReceivePayload),
            1,
            Fault::WrongType,
        );

        let err = chan.receive().unwrap_err();
        assert!(matches!(
            err,
            MessageError::Protocol {
                expected: MessageType::SendPayload,
                ..
            }
        ));
        assert_eq!(transport.lock().failures_signalled(), 1);
    }

    #[test]
    fn unreservable_size_is_out_of_memory() {
        let mut buf = vec![0u8; 4];
        assert!(matches!(
            reserve_receive_buffer(&mut buf, usize::MAX, None, 5),
            Err(MessageError::OutOfMemory {
                channel: 5,
                size: usize::MAX
            })
        ));
        assert!(matches!(
            reserve_receive_buffer(&mut buf, 9, Some(8), 5),
            Err(MessageError::OutOfMemory { size: 9, .. })
        ));
        assert_eq!(buf.len(), 4);

        reserve_receive_buffer(&mut buf, 8, Some(8), 5).unwrap();
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn oversized_announcement_is_signalled_and_channel_survives() {
        let transport = host();
        let config = ChannelConfig {
            receive_limit: Some(64 * 1024),
            ..ChannelConfig::default()
        };
        let mut chan = Channel::open_with_config(transport.clone(), PROTO, config).unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, b"fits fine".to_vec());
        transport.lock().inject(
            Step::Message(MessageType::ReceiveSize),
            1,
            Fault::Oversize,
        );
        transport.lock().clear_steps();

        let err = chan.receive().unwrap_err();
        assert!(matches!(
            err,
            MessageError::OutOfMemory { channel, size } if channel == id && size == u32::MAX as usize
        ));
        {
            let host = transport.lock();
            assert_eq!(host.failures_signalled(), 1);
            assert_eq!(host.pending(id), 1);
            assert_eq!(
                host.steps(),
                &[
                    Step::Message(MessageType::ReceiveSize),
                    Step::Message(MessageType::ReceivePayload),
                ]
            );
        }
        assert_eq!(chan.receive_capacity(), 0);

        assert_eq!(chan.receive().unwrap(), b"fits fine");
        assert_eq!(transport.lock().pending(id), 0);
    }

    #[test]
    fn failed_acknowledgement_is_signalled() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, b"ack".to_vec());
        transport.lock().inject(
            Step::Message(MessageType::ReceiveStatus),
            1,
            Fault::Reject,
        );

        assert!(chan.receive().is_err());
        assert_eq!(transport.lock().failures_signalled(), 1);
        assert_eq!(transport.lock().pending(id), 1);
    }

    #[test]
    fn rejected_poll_sends_no_failure_report() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport.lock().inject(
            Step::Message(MessageType::ReceiveSize),
            1,
            Fault::Reject,
        );
        transport.lock().clear_steps();

        assert!(chan.receive().is_err());
        assert_eq!(transport.lock().steps().len(), 1);
        assert_eq!(transport.lock().failures_signalled(), 0);
    }

    #[test]
    fn close_releases_buffer_and_slot() {
        let transport = host();
        let mut chan = Channel::open(transport.clone(), PROTO).unwrap();
        let id = chan.id();
        transport.lock().queue_message(id, vec![9u8; 64]);
        chan.receive().unwrap();

        chan.close().unwrap();
        assert!(!transport.lock().is_open(id));
    }

    #[test]
    fn close_failure_still_consumes_channel() {
        let transport = host();
        let chan = Channel::open(transport.clone(), PROTO).unwrap();
        transport
            .lock()
            .inject(Step::Message(MessageType::Close), 1, Fault::Reject);

        let err = chan.close().unwrap_err();
        assert!(matches!(
            err,
            MessageError::Rejected {
                op: Operation::Close,
                ..
            }
        ));
        // Dropping after a failed close must not send a second close.
        let closes = transport
            .lock()
            .steps()
            .iter()
            .filter(|s| **s == Step::Message(MessageType::Close))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn drop_closes_open_channel() {
        let transport = host();
        let id = {
            let chan = Channel::open(transport.clone(), PROTO).unwrap();
            chan.id()
        };
        assert!(!transport.lock().is_open(id));
    }

    #[test]
    fn channels_on_shared_transport_from_threads() {
        let transport = host_with_bandwidth(true);
        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let transport = transport.clone();
                std::thread::spawn(move || {
                    let mut chan = Channel::open(transport, PROTO).unwrap();
                    for i in 0..25u8 {
                        chan.send(&[n, i, n ^ i]).unwrap();
                    }
                    let id = chan.id();
                    chan.close().unwrap();
                    id
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(transport.lock().open_channels().is_empty());
    }
}
