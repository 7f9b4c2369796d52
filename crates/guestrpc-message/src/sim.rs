//! In-process simulated counterpart.
//!
//! [`SimulatedHost`] implements [`Backdoor`] by playing the host side of the
//! message protocol: it assigns channel ids and cookies, collects messages
//! sent by the guest, and serves queued messages back. Faults, including
//! checkpoints, can be injected at any step to exercise the retry paths.

use std::collections::VecDeque;
use std::fmt;

use guestrpc_transport::{Backdoor, Register, Registers};
use tracing::trace;

use crate::protocol::{
    Cookie, MessageStatus, MessageType, OpenFlags, COMMAND_MESSAGE, HB_COMMAND_MESSAGE,
    MAX_CHANNELS, MAX_INBOUND_MESSAGE,
};

/// One exchange as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// A low-bandwidth Open request.
    Open,
    /// A low-bandwidth request of the given type on an open channel.
    Message(MessageType),
    /// A guest-to-host bulk copy.
    BulkSend,
    /// A host-to-guest bulk copy.
    BulkReceive,
}

/// What the host does instead of serving a step normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Discard in-flight transfer state and reply with CHECKPOINT only.
    Checkpoint,
    /// Reply with no status bits at all.
    Reject,
    /// Serve the step, but tag the reply with a bogus message type.
    WrongType,
    /// Serve a receive poll, but announce a message of `u32::MAX` bytes.
    /// Other steps treat it as [`Fault::Reject`].
    Oversize,
}

/// Computes the host's reply to a message the guest delivered.
pub type Responder = Box<dyn FnMut(u32, &[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Debug)]
struct SimChannel {
    protocol: u32,
    cookie: Cookie,
    inbound: Option<Vec<u8>>,
    inbound_expected: usize,
    outbound: VecDeque<Vec<u8>>,
    sending: Option<usize>,
    delivered: Vec<Vec<u8>>,
}

impl SimChannel {
    fn reset_transfers(&mut self) {
        self.inbound = None;
        self.inbound_expected = 0;
        self.sending = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct Injection {
    step: Step,
    countdown: usize,
    fault: Fault,
}

/// A deterministic host for the message protocol.
pub struct SimulatedHost {
    slots: Vec<Option<SimChannel>>,
    cookies_supported: bool,
    high_bandwidth: bool,
    next_assignment: Option<(u16, Cookie)>,
    cookie_counter: u32,
    injections: Vec<Injection>,
    steps: Vec<Step>,
    failures_signalled: usize,
    responder: Option<Responder>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedHost")
            .field("open_channels", &self.open_channels())
            .field("cookies_supported", &self.cookies_supported)
            .field("high_bandwidth", &self.high_bandwidth)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl SimulatedHost {
    /// A host that supports cookies and advertises low-bandwidth only.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_CHANNELS).map(|_| None).collect(),
            cookies_supported: true,
            high_bandwidth: false,
            next_assignment: None,
            cookie_counter: 0x1000,
            injections: Vec::new(),
            steps: Vec::new(),
            failures_signalled: 0,
            responder: None,
        }
    }

    /// Advertise (or stop advertising) the high-bandwidth path.
    pub fn set_high_bandwidth(&mut self, enabled: bool) {
        self.high_bandwidth = enabled;
    }

    /// Model a host that predates cookie support.
    pub fn set_cookies_supported(&mut self, supported: bool) {
        self.cookies_supported = supported;
    }

    /// Fix the id and cookie handed out by the next successful Open.
    pub fn assign_next(&mut self, id: u16, cookie: Cookie) {
        self.next_assignment = Some((id, cookie));
    }

    /// Install a closure that answers delivered messages.
    pub fn set_responder(
        &mut self,
        responder: impl FnMut(u32, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) {
        self.responder = Some(Box::new(responder));
    }

    /// Apply `fault` to the `occurrence`-th (1-based) future `step`.
    pub fn inject(&mut self, step: Step, occurrence: usize, fault: Fault) {
        self.injections.push(Injection {
            step,
            countdown: occurrence.max(1),
            fault,
        });
    }

    /// Shorthand for a checkpoint on the next `step`.
    pub fn inject_checkpoint(&mut self, step: Step) {
        self.inject(step, 1, Fault::Checkpoint);
    }

    /// Queue a host-to-guest message on channel `id`.
    pub fn queue_message(&mut self, id: u16, message: impl Into<Vec<u8>>) -> bool {
        match self.slot_mut(id) {
            Some(chan) => {
                chan.outbound.push_back(message.into());
                true
            }
            None => false,
        }
    }

    /// Messages the guest delivered on channel `id`, oldest first.
    pub fn delivered(&self, id: u16) -> &[Vec<u8>] {
        self.slot(id)
            .map(|chan| chan.delivered.as_slice())
            .unwrap_or_default()
    }

    /// Host-to-guest messages not yet acknowledged on channel `id`.
    pub fn pending(&self, id: u16) -> usize {
        self.slot(id).map_or(0, |chan| chan.outbound.len())
    }

    /// Whether channel `id` is open.
    pub fn is_open(&self, id: u16) -> bool {
        self.slot(id).is_some()
    }

    /// Ids of all open channels.
    pub fn open_channels(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id as u16)
            .collect()
    }

    /// Cookie the host holds for channel `id`.
    pub fn cookie(&self, id: u16) -> Option<Cookie> {
        self.slot(id).map(|chan| chan.cookie)
    }

    /// Protocol tag channel `id` was opened with.
    pub fn protocol(&self, id: u16) -> Option<u32> {
        self.slot(id).map(|chan| chan.protocol)
    }

    /// Drop all state for channel `id`, as after a host-side restore.
    pub fn forget_channel(&mut self, id: u16) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = None;
        }
    }

    /// Replace the cookie of channel `id`, invalidating the guest's copy.
    pub fn rotate_cookie(&mut self, id: u16, cookie: Cookie) {
        if let Some(chan) = self.slot_mut(id) {
            chan.cookie = cookie;
        }
    }

    /// Number of failure reports received from the guest.
    pub fn failures_signalled(&self) -> usize {
        self.failures_signalled
    }

    /// Every step served so far, in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn clear_steps(&mut self) {
        self.steps.clear();
    }

    fn slot(&self, id: u16) -> Option<&SimChannel> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: u16) -> Option<&mut SimChannel> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn authorized(&mut self, id: u16, cookie: Cookie) -> Option<&mut SimChannel> {
        self.slot_mut(id).filter(|chan| chan.cookie == cookie)
    }

    fn take_fault(&mut self, step: Step) -> Option<Fault> {
        self.steps.push(step);
        let mut fired = None;
        self.injections.retain_mut(|injection| {
            if fired.is_some() || injection.step != step {
                return true;
            }
            injection.countdown -= 1;
            if injection.countdown == 0 {
                fired = Some(injection.fault);
                return false;
            }
            true
        });
        fired
    }

    fn deliver(&mut self, id: u16, message: Vec<u8>) {
        let Some(chan) = self.slot_mut(id) else {
            return;
        };
        let protocol = chan.protocol;
        chan.delivered.push(message.clone());
        trace!(channel = id, len = message.len(), "host received message");

        let reply = match self.responder.as_mut() {
            Some(responder) => responder(protocol, &message),
            None => None,
        };
        if let (Some(reply), Some(chan)) = (reply, self.slot_mut(id)) {
            chan.outbound.push_back(reply);
        }
    }

    fn open(&mut self, bx: u32) -> (MessageStatus, u16, Cookie) {
        let flags = OpenFlags::from_bits_truncate(bx);
        let protocol = bx & !OpenFlags::all().bits();

        if flags.contains(OpenFlags::COOKIE) && !self.cookies_supported {
            return (MessageStatus::FAILURE, 0, Cookie::default());
        }

        let id = match self.next_assignment.map(|(id, _)| id) {
            Some(id) if self.slots.get(id as usize).is_some_and(Option::is_none) => id,
            Some(_) => return (MessageStatus::FAILURE, 0, Cookie::default()),
            None => match self.slots.iter().position(Option::is_none) {
                Some(free) => free as u16,
                None => return (MessageStatus::FAILURE, 0, Cookie::default()),
            },
        };

        let cookie = if flags.contains(OpenFlags::COOKIE) {
            match self.next_assignment.take() {
                Some((_, cookie)) => cookie,
                None => {
                    self.cookie_counter = self.cookie_counter.wrapping_add(1);
                    Cookie::new(self.cookie_counter, !self.cookie_counter)
                }
            }
        } else {
            self.next_assignment = None;
            Cookie::default()
        };

        self.slots[id as usize] = Some(SimChannel {
            protocol,
            cookie,
            inbound: None,
            inbound_expected: 0,
            outbound: VecDeque::new(),
            sending: None,
            delivered: Vec::new(),
        });
        (MessageStatus::SUCCESS, id, cookie)
    }

    fn serve_basic(&mut self, ty: MessageType, regs: &Registers) -> (MessageStatus, Registers) {
        let id = regs.dx.high();
        let cookie = Cookie::new(regs.si.word(), regs.di.word());
        let high_bandwidth = if self.high_bandwidth {
            MessageStatus::HIGH_BANDWIDTH
        } else {
            MessageStatus::empty()
        };
        let mut out = *regs;

        if ty == MessageType::Close {
            if self.authorized(id, cookie).is_none() {
                return (MessageStatus::FAILURE, out);
            }
            self.forget_channel(id);
            return (MessageStatus::SUCCESS, out);
        }

        let Some(chan) = self.authorized(id, cookie) else {
            return (MessageStatus::FAILURE, out);
        };

        match ty {
            MessageType::SendSize => {
                let size = regs.bx.quad() as usize;
                if size > MAX_INBOUND_MESSAGE {
                    return (MessageStatus::FAILURE, out);
                }
                chan.inbound = Some(Vec::with_capacity(size));
                chan.inbound_expected = size;
                if size == 0 {
                    chan.inbound = None;
                    self.deliver(id, Vec::new());
                }
                (MessageStatus::SUCCESS | high_bandwidth, out)
            }
            MessageType::SendPayload => {
                let expected = chan.inbound_expected;
                let Some(data) = chan.inbound.as_mut() else {
                    return (MessageStatus::FAILURE, out);
                };
                let take = (expected - data.len()).min(4);
                data.extend_from_slice(&regs.bx.word().to_le_bytes()[..take]);
                if data.len() == expected {
                    let message = std::mem::take(data);
                    chan.inbound = None;
                    self.deliver(id, message);
                }
                (MessageStatus::SUCCESS, out)
            }
            MessageType::ReceiveSize => match chan.outbound.front() {
                Some(front) => {
                    out.bx = Register::from_quad(front.len() as u64);
                    out.dx = out.dx.with_high(MessageType::SendSize as u16);
                    chan.sending = Some(0);
                    (
                        MessageStatus::SUCCESS | MessageStatus::DO_RECEIVE | high_bandwidth,
                        out,
                    )
                }
                None => (MessageStatus::SUCCESS, out),
            },
            MessageType::ReceivePayload => {
                if regs.bx.low() == MessageStatus::FAILURE.bits() {
                    chan.sending = None;
                    self.failures_signalled += 1;
                    return (MessageStatus::SUCCESS, out);
                }
                let (Some(offset), Some(front)) = (chan.sending, chan.outbound.front()) else {
                    return (MessageStatus::FAILURE, out);
                };
                let end = (offset + 4).min(front.len());
                let mut word = [0u8; 4];
                word[..end - offset].copy_from_slice(&front[offset..end]);
                chan.sending = Some(end);
                out.bx = Register::from_word(u32::from_le_bytes(word));
                out.dx = out.dx.with_high(MessageType::SendPayload as u16);
                (MessageStatus::SUCCESS, out)
            }
            MessageType::ReceiveStatus => {
                if regs.bx.low() == MessageStatus::FAILURE.bits() {
                    chan.sending = None;
                    self.failures_signalled += 1;
                    return (MessageStatus::SUCCESS, out);
                }
                if chan.sending.take().is_none() {
                    return (MessageStatus::FAILURE, out);
                }
                chan.outbound.pop_front();
                (MessageStatus::SUCCESS, out)
            }
            MessageType::Open | MessageType::Close => (MessageStatus::FAILURE, out),
        }
    }
}

fn basic_reply(mut regs: Registers, status: MessageStatus) -> Registers {
    regs.cx = Register::from_halves(status.bits(), COMMAND_MESSAGE);
    regs
}

fn bulk_reply(mut regs: Registers, status: MessageStatus) -> Registers {
    regs.bx = Register::from_halves(status.bits(), HB_COMMAND_MESSAGE);
    regs
}

impl Backdoor for SimulatedHost {
    fn exchange(&mut self, regs: Registers) -> Registers {
        if regs.cx.low() != COMMAND_MESSAGE {
            return basic_reply(regs, MessageStatus::FAILURE);
        }
        let Ok(ty) = MessageType::try_from(regs.cx.high()) else {
            return basic_reply(regs, MessageStatus::FAILURE);
        };

        if ty == MessageType::Open {
            match self.take_fault(Step::Open) {
                Some(Fault::Checkpoint) => return basic_reply(regs, MessageStatus::CHECKPOINT),
                Some(Fault::Reject) => return basic_reply(regs, MessageStatus::FAILURE),
                Some(Fault::WrongType | Fault::Oversize) | None => {}
            }
            let (status, id, cookie) = self.open(regs.bx.word());
            let mut out = regs;
            if status.is_success() {
                out.dx = out.dx.with_high(id);
                out.si = Register::from_word(cookie.high);
                out.di = Register::from_word(cookie.low);
            }
            return basic_reply(out, status);
        }

        let id = regs.dx.high();
        match self.take_fault(Step::Message(ty)) {
            Some(Fault::Checkpoint) => {
                if let Some(chan) = self.slot_mut(id) {
                    chan.reset_transfers();
                }
                basic_reply(regs, MessageStatus::CHECKPOINT)
            }
            Some(Fault::Reject) => basic_reply(regs, MessageStatus::FAILURE),
            Some(Fault::Oversize) if ty == MessageType::ReceiveSize => {
                let (status, mut out) = self.serve_basic(ty, &regs);
                if status.contains(MessageStatus::DO_RECEIVE) {
                    out.bx = Register::from_quad(u64::from(u32::MAX));
                }
                basic_reply(out, status)
            }
            Some(Fault::Oversize) => basic_reply(regs, MessageStatus::FAILURE),
            Some(Fault::WrongType) => {
                let (status, mut out) = self.serve_basic(ty, &regs);
                out.dx = out.dx.with_high(MessageType::Close as u16);
                basic_reply(out, status)
            }
            None => {
                let (status, out) = self.serve_basic(ty, &regs);
                basic_reply(out, status)
            }
        }
    }

    fn bulk_send(&mut self, regs: Registers, payload: &[u8]) -> Registers {
        let id = regs.dx.high();
        let cookie = Cookie::new(regs.bp.word(), regs.di.word());
        if let Some(fault) = self.take_fault(Step::BulkSend) {
            return self.bulk_fault(regs, id, fault);
        }
        if regs.bx.low() != HB_COMMAND_MESSAGE || !self.high_bandwidth {
            return bulk_reply(regs, MessageStatus::FAILURE);
        }
        let Some(chan) = self.authorized(id, cookie) else {
            return bulk_reply(regs, MessageStatus::FAILURE);
        };
        if chan.inbound.is_none() || chan.inbound_expected != payload.len() {
            return bulk_reply(regs, MessageStatus::FAILURE);
        }
        chan.inbound = None;
        self.deliver(id, payload.to_vec());
        bulk_reply(regs, MessageStatus::SUCCESS)
    }

    fn bulk_receive(&mut self, regs: Registers, buf: &mut [u8]) -> Registers {
        let id = regs.dx.high();
        let cookie = Cookie::new(regs.si.word(), regs.bp.word());
        if let Some(fault) = self.take_fault(Step::BulkReceive) {
            return self.bulk_fault(regs, id, fault);
        }
        if regs.bx.low() != HB_COMMAND_MESSAGE || !self.high_bandwidth {
            return bulk_reply(regs, MessageStatus::FAILURE);
        }
        let Some(chan) = self.authorized(id, cookie) else {
            return bulk_reply(regs, MessageStatus::FAILURE);
        };
        let (Some(0), Some(front)) = (chan.sending, chan.outbound.front()) else {
            return bulk_reply(regs, MessageStatus::FAILURE);
        };
        if front.len() != buf.len() {
            return bulk_reply(regs, MessageStatus::FAILURE);
        }
        buf.copy_from_slice(front);
        chan.sending = Some(buf.len());
        bulk_reply(regs, MessageStatus::SUCCESS)
    }
}

impl SimulatedHost {
    fn bulk_fault(&mut self, regs: Registers, id: u16, fault: Fault) -> Registers {
        match fault {
            Fault::Checkpoint => {
                if let Some(chan) = self.slot_mut(id) {
                    chan.reset_transfers();
                }
                bulk_reply(regs, MessageStatus::CHECKPOINT)
            }
            Fault::Reject | Fault::WrongType | Fault::Oversize => {
                bulk_reply(regs, MessageStatus::FAILURE)
            }
        }
    }
}
