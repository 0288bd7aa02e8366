//! The IRC client protocol state machine.
//!
//! A session owns everything above the socket for one connection attempt:
//! registration, capability negotiation, ISUPPORT state, the channel
//! rosters, keepalive and rejoin timers, and the translation between wire
//! messages and bus events. The connection layer feeds it lines, bus events
//! and timer expiries, and writes out whatever it queues; nothing in here
//! performs I/O, which keeps the whole machine testable without a server.

use crate::config::ClientConfig;
use crate::wire::{build_line, Message, Prefix};
use relay_events::{kinds, ChatPayload, ChatSource, Event, EventBus, Protocol, SendCommand, TimerSet};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub(crate) const REJOIN_DELAY: Duration = Duration::from_secs(30);
pub(crate) const PING_FREQUENCY: Duration = Duration::from_secs(30);
pub(crate) const CAP_FALLBACK: Duration = Duration::from_secs(2);

/// Capabilities the client knows how to use.
const SUPPORTED_CAPS: [&str; 5] = [
    "away-notify",
    "account-notify",
    "extended-join",
    "multi-prefix",
    "userhost-in-names",
];

/// Channels joined per JOIN command when batching.
const JOIN_BATCH: usize = 5;

/// Purpose-keyed timers owned by one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum IrcTimer {
    /// Force CAP END if the server never ACKs our request
    CapFallback,
    /// Periodic liveness check
    PingCheck,
    /// Recurring attempt to join any channel still unjoined
    JoinSweep,
    /// Delayed rejoin of a single channel (after a KICK)
    Rejoin(String),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelUser {
    /// Display-case nick
    pub nick: String,
    /// Prefix-mode letters held, e.g. "ov"
    pub status: String,
    /// Services account, empty when unknown or logged out
    pub account: String,
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub name: String,
    pub key: Option<String>,
    pub joined: bool,
    /// Lowercased nick → user
    pub users: HashMap<String, ChannelUser>,
}

pub(crate) struct Session {
    config: Arc<ClientConfig>,
    bus: Arc<EventBus>,
    pub(crate) timers: TimerSet<IrcTimer>,
    out: VecDeque<String>,
    pending_disconnect: Option<String>,

    /// Lowercased channel name → channel state
    pub(crate) chans: HashMap<String, Channel>,

    // ISUPPORT state
    pub(crate) chantypes: String,
    pub(crate) prefix_symbols: String,
    pub(crate) prefix_modes: String,
    pub(crate) chanmodes: [String; 4],
    pub(crate) has_whox: bool,

    // CAP negotiation
    caps: HashMap<&'static str, bool>,
    cap_requested: Vec<String>,
    cap_done: bool,

    // Nick state
    pub(crate) nick: String,
    pending_nick: String,
    nick_inc: Option<u32>,

    has_performed: bool,
    ping_seen: bool,
    pub(crate) error_msg: Option<String>,
}

impl Session {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        bus: Arc<EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<IrcTimer>) {
        let (timers, timer_rx) = TimerSet::new();
        let chans = config
            .channels
            .iter()
            .map(|(lower, chan)| {
                (
                    lower.clone(),
                    Channel {
                        name: chan.name.clone(),
                        key: chan.key.clone(),
                        joined: false,
                        users: HashMap::new(),
                    },
                )
            })
            .collect();
        let nick = config.user.nick.clone();
        (
            Self {
                config,
                bus,
                timers,
                out: VecDeque::new(),
                pending_disconnect: None,
                chans,
                chantypes: "#".to_string(),
                prefix_symbols: "@+".to_string(),
                prefix_modes: "ov".to_string(),
                chanmodes: [
                    "b".to_string(),
                    "k".to_string(),
                    "l".to_string(),
                    "imnpst".to_string(),
                ],
                has_whox: false,
                caps: SUPPORTED_CAPS.iter().map(|cap| (*cap, false)).collect(),
                cap_requested: Vec::new(),
                cap_done: false,
                pending_nick: nick.clone(),
                nick,
                nick_inc: None,
                has_performed: false,
                ping_seen: false,
                error_msg: None,
            },
            timer_rx,
        )
    }

    /// Lines queued for transmission since the last drain.
    pub(crate) fn take_outbound(&mut self) -> Vec<String> {
        self.out.drain(..).collect()
    }

    /// A reason means the session wants the transport closed.
    pub(crate) fn take_disconnect(&mut self) -> Option<String> {
        self.pending_disconnect.take()
    }

    /// Begin registration on a fresh transport.
    pub(crate) fn on_connected(&mut self) {
        info!("Connection established");
        self.reset_ping();
        self.send("CAP", &["LS"]);
        if let Some(password) = self.config.server.password.clone() {
            self.send("PASS", &[&password]);
        }
        let nick = self.config.user.nick.clone();
        let username = self.config.user.username.clone();
        let gecos = self.config.user.gecos.clone();
        self.send("NICK", &[&nick]);
        self.send("USER", &[&username, "0", "*", &gecos]);
    }

    /// Process one inbound line. Any traffic counts as liveness.
    pub(crate) fn on_line(&mut self, line: &str) {
        self.reset_ping();
        trace!("Received line: {}", line);
        let Some(msg) = Message::parse(line) else {
            return;
        };
        match msg.command.as_str() {
            "005" => self.on_005(&msg),
            "353" => self.on_353(&msg),
            "354" => self.on_354(&msg),
            "366" => self.on_366(&msg),
            "433" => self.on_433(&msg),
            "ACCOUNT" => self.on_account(&msg),
            "CAP" => self.on_cap(&msg),
            "ERROR" => self.on_error(&msg),
            "JOIN" => self.on_join(&msg),
            "KICK" => self.on_kick(&msg),
            "KILL" => self.on_kill(&msg),
            "MODE" => self.on_mode(&msg),
            "NICK" => self.on_nick(&msg),
            "PART" => self.on_part(&msg),
            "PING" => self.on_ping(&msg),
            "PRIVMSG" => self.on_privmsg(&msg),
            "QUIT" => self.on_quit(&msg),
            _ => {}
        }
    }

    /// Handle a timer expiry.
    pub(crate) fn on_timer(&mut self, timer: IrcTimer) {
        match timer {
            IrcTimer::CapFallback => {
                if !self.cap_done {
                    self.send("CAP", &["END"]);
                    self.cap_done = true;
                }
            }
            IrcTimer::PingCheck => {
                if self.ping_seen {
                    self.ping_seen = false;
                    self.send("PING", &["CHECKCONN"]);
                    self.timers.schedule(IrcTimer::PingCheck, PING_FREQUENCY);
                } else {
                    self.disconnect("Ping Timeout");
                }
            }
            IrcTimer::JoinSweep => self.join_channels(),
            IrcTimer::Rejoin(chan) => self.rejoin_channel(&chan),
        }
    }

    /// Bus event delivery: only IRC_SENDCMD is meaningful to an IRC client.
    pub(crate) fn handle_event(&mut self, event: &Event) {
        if event.kind != kinds::IRC_SENDCMD {
            return;
        }
        match event.payload_as::<SendCommand>() {
            Ok(cmd) => self.send_raw(cmd.command),
            Err(e) => warn!("Event {} missing command to execute: {}", event.kind, e),
        }
    }

    fn disconnect(&mut self, reason: &str) {
        self.send("QUIT", &[reason]);
        self.pending_disconnect = Some(reason.to_string());
    }

    fn send(&mut self, command: &str, params: &[&str]) {
        self.send_raw(build_line(command, params));
    }

    fn send_raw(&mut self, line: String) {
        if line.is_empty() {
            return;
        }
        trace!("Sent line: {}", line);
        self.out.push_back(line);
    }

    fn reset_ping(&mut self) {
        self.ping_seen = true;
        self.timers.schedule(IrcTimer::PingCheck, PING_FREQUENCY);
    }

    fn emit(&mut self, kind: &str, payload: ChatPayload) {
        debug!("Event {}: {:?}", kind, payload);
        match serde_json::to_value(&payload) {
            Ok(value) => {
                self.bus
                    .send_event(crate::MODULE_NAME, &self.config.name, Protocol::Irc, kind, value)
            }
            Err(e) => warn!("Unable to encode {} payload: {}", kind, e),
        }
    }

    fn is_channel(&self, name: &str) -> bool {
        name.chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    fn my_nick_lower(&self) -> String {
        self.nick.to_lowercase()
    }

    // RPL_ISUPPORT
    fn on_005(&mut self, msg: &Message) {
        let end = msg.params.len().saturating_sub(1);
        for isup in msg.params.get(1..end).unwrap_or_default() {
            let (key, value) = match isup.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (isup.as_str(), None),
            };
            match key {
                "CHANTYPES" => {
                    if let Some(value) = value.filter(|v| !v.is_empty()) {
                        self.chantypes = value.to_string();
                    }
                }
                "PREFIX" => {
                    // Value of the form "(modes)symbols", e.g. "(ov)@+"
                    if let Some((modes, symbols)) =
                        value.and_then(|v| v.split_once(')'))
                    {
                        self.prefix_modes = modes.trim_start_matches('(').to_string();
                        self.prefix_symbols = symbols.to_string();
                    }
                }
                "CHANMODES" => {
                    if let Some(value) = value.filter(|v| !v.is_empty()) {
                        let mut classes = value.split(',');
                        self.chanmodes = std::array::from_fn(|_| {
                            classes.next().unwrap_or_default().to_string()
                        });
                    }
                }
                "WHOX" => self.has_whox = true,
                _ => {}
            }
        }

        if self.has_performed {
            return;
        }
        for chan in self.chans.values_mut() {
            chan.joined = false;
        }
        self.join_channels();
        self.has_performed = true;
    }

    // RPL_NAMREPLY
    fn on_353(&mut self, msg: &Message) {
        let len = msg.params.len();
        if len < 2 {
            return;
        }
        let lower = msg.params[len - 2].to_lowercase();
        let list = msg.params[len - 1].clone();
        let prefix_symbols = self.prefix_symbols.clone();
        let prefix_modes = self.prefix_modes.clone();
        let Some(chan) = self.chans.get_mut(&lower) else {
            return;
        };

        for token in list.split(' ').filter(|t| !t.is_empty()) {
            let split = token
                .find(|c| !prefix_symbols.contains(c))
                .unwrap_or(token.len());
            let symbols = &token[..split];
            // With userhost-in-names the token is a full nick!ident@host.
            let who = Prefix::parse(&token[split..]);
            let status: String = symbols
                .chars()
                .filter_map(|sym| {
                    prefix_symbols
                        .find(sym)
                        .and_then(|i| prefix_modes.chars().nth(i))
                })
                .collect();

            let entry = chan
                .users
                .entry(who.name.to_lowercase())
                .or_insert_with(|| ChannelUser {
                    nick: who.name.clone(),
                    ..Default::default()
                });
            entry.status = status;
        }
    }

    // RPL_WHOSPCRPL, tag 696 only
    fn on_354(&mut self, msg: &Message) {
        if msg.params.len() < 4 || msg.params[1] != "696" {
            return;
        }
        let who = msg.params[2].to_lowercase();
        let mut account = msg.params[3].clone();
        if account == "0" {
            account.clear();
        }
        for chan in self.chans.values_mut() {
            if let Some(user) = chan.users.get_mut(&who) {
                user.account = account.clone();
            }
        }
    }

    // RPL_ENDOFNAMES
    fn on_366(&mut self, msg: &Message) {
        if !self.has_whox || msg.params.len() < 2 {
            return;
        }
        let chan = msg.params[msg.params.len() - 2].clone();
        if self.chans.contains_key(&chan.to_lowercase()) {
            self.send("WHO", &[&chan, "%tna,696"]);
        }
    }

    // ERR_NICKNAMEINUSE
    fn on_433(&mut self, msg: &Message) {
        let Some(target) = msg.params.first() else {
            return;
        };
        let conflict = msg.params.get(1).cloned().unwrap_or_default();
        if target == "*"
            || target.to_lowercase() == self.my_nick_lower()
            || conflict.to_lowercase() == self.pending_nick.to_lowercase()
        {
            let inc = self.nick_inc.map(|i| i + 1).unwrap_or(0);
            self.nick_inc = Some(inc);
            self.pending_nick = format!("{}{:04}", self.config.user.nick, inc);
            let nick = self.pending_nick.clone();
            self.send("NICK", &[&nick]);
        }
    }

    // account-notify
    fn on_account(&mut self, msg: &Message) {
        let Some(source) = &msg.source else {
            return;
        };
        let who = source.name.to_lowercase();
        let mut account = msg.params.first().cloned().unwrap_or_default();
        if account == "*" {
            account.clear();
        }
        for chan in self.chans.values_mut() {
            if let Some(user) = chan.users.get_mut(&who) {
                user.account = account.clone();
            }
        }
    }

    fn on_cap(&mut self, msg: &Message) {
        let Some(sub) = msg.params.get(1) else {
            return;
        };
        let caps_param = msg.params.last().cloned().unwrap_or_default();
        match sub.as_str() {
            "LS" => {
                // A fresh LS supersedes any negotiation already in flight.
                self.timers.cancel(&IrcTimer::CapFallback);
                let req: Vec<String> = caps_param
                    .split(' ')
                    .filter(|cap| self.caps.contains_key(cap))
                    .map(str::to_string)
                    .collect();
                if req.is_empty() {
                    if !self.cap_done {
                        self.send("CAP", &["END"]);
                        self.cap_done = true;
                    }
                    return;
                }
                let joined = req.join(" ");
                self.send("CAP", &["REQ", &joined]);
                self.cap_requested = req;
                self.timers.schedule(IrcTimer::CapFallback, CAP_FALLBACK);
            }
            "ACK" => {
                for cap in caps_param.split(' ') {
                    if let Some(enabled) = self.caps.get_mut(cap) {
                        *enabled = true;
                    }
                    self.cap_requested.retain(|c| c != cap);
                }
                // Everything we asked for arrived: end negotiation now and
                // keep the fallback timer only as a safety net.
                if self.cap_requested.is_empty() && !self.cap_done {
                    self.timers.cancel(&IrcTimer::CapFallback);
                    self.send("CAP", &["END"]);
                    self.cap_done = true;
                }
            }
            _ => {}
        }
    }

    fn on_error(&mut self, msg: &Message) {
        if let Some(reason) = msg.params.last() {
            tracing::error!("Received error: {}", reason);
            self.error_msg = Some(reason.clone());
        }
    }

    fn on_mode(&mut self, msg: &Message) {
        let (Some(target), Some(modes)) = (msg.params.first(), msg.params.get(1)) else {
            return;
        };
        let lower = target.to_lowercase();
        if !self.chans.contains_key(&lower) {
            return;
        }
        let modes = modes.clone();
        let params = msg.params.clone();
        let mut next = 2usize;
        let mut add = true;

        for m in modes.chars() {
            match m {
                '+' => add = true,
                '-' => add = false,
                _ if self.prefix_modes.contains(m) => {
                    if let Some(who) = params.get(next) {
                        let who = who.to_lowercase();
                        if let Some(user) = self
                            .chans
                            .get_mut(&lower)
                            .and_then(|chan| chan.users.get_mut(&who))
                        {
                            if add {
                                if !user.status.contains(m) {
                                    user.status.push(m);
                                }
                            } else {
                                user.status.retain(|c| c != m);
                            }
                        }
                    }
                    next += 1;
                }
                _ if self.chanmodes[0].contains(m) => next += 1,
                _ if self.chanmodes[1].contains(m) => next += 1,
                _ if self.chanmodes[2].contains(m) && add => next += 1,
                _ => {}
            }
        }
    }

    fn on_join(&mut self, msg: &Message) {
        let Some(source) = msg.source.clone() else {
            return;
        };
        let Some(chan) = msg.params.first() else {
            return;
        };
        let lower = chan.to_lowercase();
        let who = source.name.to_lowercase();
        // extended-join carries the account as the second parameter.
        let account = match msg.params.get(1) {
            Some(acct) if acct != "*" => acct.clone(),
            _ => String::new(),
        };

        if who == self.my_nick_lower() {
            if let Some(chan) = self.chans.get_mut(&lower) {
                info!("Joined channel {}", chan.name);
                chan.joined = true;
                chan.users.clear();
            }
            self.timers.cancel(&IrcTimer::Rejoin(lower.clone()));
        }

        if let Some(chan) = self.chans.get_mut(&lower) {
            debug!("Added user {} to channel {}", who, lower);
            chan.users.insert(
                who,
                ChannelUser {
                    nick: source.name,
                    status: String::new(),
                    account,
                },
            );
        }
    }

    fn on_kick(&mut self, msg: &Message) {
        let (Some(chan), Some(victim)) = (msg.params.first(), msg.params.get(1)) else {
            return;
        };
        let lower = chan.to_lowercase();
        let victim = victim.to_lowercase();

        if victim == self.my_nick_lower() {
            if let Some(chan) = self.chans.get_mut(&lower) {
                info!("Kicked from channel {}", chan.name);
                chan.joined = false;
            }
            self.timers
                .schedule(IrcTimer::Rejoin(lower), REJOIN_DELAY);
        } else if let Some(chan) = self.chans.get_mut(&lower) {
            chan.users.remove(&victim);
        }
    }

    fn on_kill(&mut self, msg: &Message) {
        let Some(victim) = msg.params.first() else {
            return;
        };
        let victim = victim.to_lowercase();
        if victim == self.my_nick_lower() {
            debug!("Killed from the network");
            return;
        }
        for chan in self.chans.values_mut() {
            chan.users.remove(&victim);
        }
    }

    fn on_nick(&mut self, msg: &Message) {
        let Some(source) = &msg.source else {
            return;
        };
        let Some(newnick) = msg.params.first().cloned() else {
            return;
        };
        let who = source.name.to_lowercase();

        if who == self.my_nick_lower() {
            info!("Changed nick to {}", newnick);
            self.nick = newnick.clone();
            self.pending_nick = newnick.clone();
        }

        let newlower = newnick.to_lowercase();
        for chan in self.chans.values_mut() {
            if let Some(mut user) = chan.users.remove(&who) {
                user.nick = newnick.clone();
                chan.users.insert(newlower.clone(), user);
            }
        }
    }

    fn on_part(&mut self, msg: &Message) {
        let Some(source) = &msg.source else {
            return;
        };
        let Some(chan) = msg.params.first() else {
            return;
        };
        let lower = chan.to_lowercase();
        let who = source.name.to_lowercase();

        if who == self.my_nick_lower() {
            let rejoin = self.chans.get_mut(&lower).map(|chan| {
                info!("Parted channel {}", chan.name);
                chan.joined = false;
                (chan.name.clone(), chan.key.clone())
            });
            // Voluntary departure: try to get back in straight away.
            if let Some((name, key)) = rejoin {
                match key {
                    Some(key) => self.send("JOIN", &[&name, &key]),
                    None => self.send("JOIN", &[&name]),
                }
            }
        } else if let Some(chan) = self.chans.get_mut(&lower) {
            chan.users.remove(&who);
        }
    }

    fn on_ping(&mut self, msg: &Message) {
        let token = msg.params.first().cloned().unwrap_or_default();
        self.send("PONG", &[&token]);
    }

    fn on_quit(&mut self, msg: &Message) {
        let Some(source) = &msg.source else {
            return;
        };
        let who = source.name.to_lowercase();
        if who == self.my_nick_lower() {
            return;
        }
        for chan in self.chans.values_mut() {
            chan.users.remove(&who);
        }
    }

    fn on_privmsg(&mut self, msg: &Message) {
        let Some(source) = msg.source.clone() else {
            return;
        };
        let Some(target) = msg.params.first().cloned() else {
            return;
        };
        let Some(text) = msg.params.last().cloned() else {
            return;
        };
        if text.is_empty() {
            return;
        }
        let target_lower = target.to_lowercase();

        if self.chans.contains_key(&target_lower) {
            self.on_channel_privmsg(&source, &target, &target_lower, &text);
        } else {
            self.on_private_privmsg(&source, &target, &text);
        }
    }

    fn on_channel_privmsg(&mut self, source: &Prefix, target: &str, lower: &str, text: &str) {
        let mut joined = false;
        let mut modes = String::new();
        let mut account = String::new();
        let mut reply: Option<String> = None;

        if let Some(chan) = self.chans.get(lower) {
            joined = chan.joined;
            if let Some(user) = chan.users.get(&source.name.to_lowercase()) {
                modes = user.status.clone();
                account = user.account.clone();
            }

            let mut words = text.split(' ');
            match words.next() {
                Some("?ops") if modes.contains('o') => {
                    let mut ops: Vec<&str> = chan
                        .users
                        .values()
                        .filter(|u| u.status.contains('o'))
                        .map(|u| u.nick.as_str())
                        .collect();
                    ops.sort_unstable();
                    reply = Some(format!("Ops: {}", ops.join(", ")));
                }
                Some("?account") if modes.contains('o') => {
                    reply = words.next().map(|who| {
                        match chan.users.get(&who.to_lowercase()) {
                            None => format!("There is no user named {who}"),
                            Some(user) if user.account.is_empty() => {
                                format!("I do not know what account {who} is logged in as")
                            }
                            Some(user) => format!("{who} is logged in as {}", user.account),
                        }
                    });
                }
                _ => {}
            }
        }

        if let Some(reply) = reply {
            self.send("PRIVMSG", &[target, &reply]);
            return;
        }
        if !joined {
            return;
        }

        let (kind, body) = classify_action(text);
        let payload = ChatPayload {
            name: source.name.clone(),
            target: lower.to_string(),
            message: body.to_string(),
            source: ChatSource {
                full: source.full.clone(),
                name: source.name.clone(),
                ident: source.ident.clone(),
                host: source.host.clone(),
                modes,
                account,
            },
        };
        let kind = if kind { kinds::CHANNEL_ACTION } else { kinds::CHANNEL_MESSAGE };
        self.emit(kind, payload);
    }

    fn on_private_privmsg(&mut self, source: &Prefix, target: &str, text: &str) {
        if let Some(inner) = text.strip_prefix('\x01') {
            let inner = inner.strip_suffix('\x01').unwrap_or(inner);
            let is_version = inner
                .split(' ')
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case("VERSION"));
            if is_version {
                let version = format!("\x01VERSION relaybot {}\x01", env!("CARGO_PKG_VERSION"));
                let name = source.name.clone();
                self.send("NOTICE", &[&name, &version]);
            }
        }

        if self.is_channel(target) {
            return;
        }
        let (action, body) = classify_action(text);
        let payload = ChatPayload {
            name: source.name.clone(),
            target: target.to_string(),
            message: body.to_string(),
            source: ChatSource {
                full: source.full.clone(),
                name: source.name.clone(),
                ident: source.ident.clone(),
                host: source.host.clone(),
                modes: String::new(),
                account: String::new(),
            },
        };
        let kind = if action { kinds::USER_ACTION } else { kinds::USER_MESSAGE };
        self.emit(kind, payload);
    }

    /// Send JOINs for every channel not currently joined, batching keyless
    /// channels up to five per command and keyed channels in parallel
    /// name/key lists. Re-arms the sweep timer while anything is unjoined.
    fn join_channels(&mut self) {
        debug!("Checking channels to JOIN");
        let mut keyless: Vec<String> = Vec::new();
        let mut keyed: Vec<(String, String)> = Vec::new();
        for chan in self.chans.values() {
            if chan.joined {
                continue;
            }
            match &chan.key {
                Some(key) => keyed.push((chan.name.clone(), key.clone())),
                None => keyless.push(chan.name.clone()),
            }
        }
        if keyless.is_empty() && keyed.is_empty() {
            return;
        }
        keyless.sort_unstable();
        keyed.sort_unstable();

        let mut lines = Vec::new();
        for batch in keyless.chunks(JOIN_BATCH) {
            lines.push(build_line("JOIN", &[&batch.join(",")]));
        }
        for batch in keyed.chunks(JOIN_BATCH) {
            let names = batch
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let keys = batch
                .iter()
                .map(|(_, key)| key.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(build_line("JOIN", &[&names, &keys]));
        }
        for line in lines {
            debug!("Joining channels: {}", line);
            self.send_raw(line);
        }
        self.timers.schedule(IrcTimer::JoinSweep, REJOIN_DELAY);
    }

    /// One delayed rejoin attempt for a single channel.
    fn rejoin_channel(&mut self, lower: &str) {
        let Some(chan) = self.chans.get(lower) else {
            return;
        };
        if chan.joined {
            return;
        }
        debug!("Attempting to join channel {}", lower);
        let (name, key) = (chan.name.clone(), chan.key.clone());
        match key {
            Some(key) => self.send("JOIN", &[&name, &key]),
            None => self.send("JOIN", &[&name]),
        }
        self.timers
            .schedule(IrcTimer::Rejoin(lower.to_string()), REJOIN_DELAY);
    }
}

/// Split a CTCP ACTION wrapper off a message body. Returns whether the text
/// was an action, plus the effective body.
fn classify_action(text: &str) -> (bool, &str) {
    if let Some(rest) = text.strip_prefix("\u{1}ACTION ") {
        if !rest.is_empty() {
            return (true, rest.strip_suffix('\u{1}').unwrap_or(rest));
        }
    }
    (false, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, ServerConfig, UserConfig};
    use relay_events::{EndpointId, EventInbox};

    fn config(channels: &[(&str, Option<&str>)]) -> Arc<ClientConfig> {
        Arc::new(ClientConfig {
            name: "net1".to_string(),
            server: ServerConfig {
                host: "irc.example.net".to_string(),
                port: 6667,
                tls: false,
                password: None,
            },
            user: UserConfig {
                nick: "relay".to_string(),
                username: "relay".to_string(),
                gecos: "Relay Bot".to_string(),
            },
            channels: channels
                .iter()
                .map(|(name, key)| {
                    (
                        name.to_lowercase(),
                        ChannelConfig {
                            name: name.to_string(),
                            key: key.map(str::to_string),
                        },
                    )
                })
                .collect(),
            reconnect_delay: Duration::from_secs(30),
            connect_retry_delay: Duration::from_secs(10),
        })
    }

    fn session(channels: &[(&str, Option<&str>)]) -> (Session, Arc<EventBus>, EventInbox) {
        let bus = Arc::new(EventBus::new());
        let observer = bus
            .register(EndpointId::new("relay", "observer"), Protocol::Udp)
            .unwrap();
        let (session, _timer_rx) = Session::new(config(channels), bus.clone());
        (session, bus, observer)
    }

    fn register(session: &mut Session) {
        session.on_connected();
        session.on_line(":server 005 relay CHANTYPES=# PREFIX=(ov)@+ WHOX :are supported");
        session.take_outbound();
    }

    #[tokio::test]
    async fn registration_sends_cap_nick_user() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        session.on_connected();
        let out = session.take_outbound();
        assert_eq!(out[0], "CAP LS");
        assert_eq!(out[1], "NICK relay");
        assert_eq!(out[2], "USER relay 0 * :Relay Bot");
    }

    #[tokio::test]
    async fn prefix_map_is_derived_from_005() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_line(":server 005 relay PREFIX=(qov)~@+ CHANTYPES=#& :are supported");
        assert_eq!(session.prefix_modes, "qov");
        assert_eq!(session.prefix_symbols, "~@+");
        assert_eq!(session.chantypes, "#&");
    }

    #[tokio::test]
    async fn chanmodes_classes_are_split() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_line(":server 005 relay CHANMODES=eIbq,k,flj,imnpst :are supported");
        assert_eq!(session.chanmodes[0], "eIbq");
        assert_eq!(session.chanmodes[1], "k");
        assert_eq!(session.chanmodes[2], "flj");
        assert_eq!(session.chanmodes[3], "imnpst");
    }

    #[tokio::test]
    async fn first_005_batches_joins() {
        let channels: Vec<(&str, Option<&str>)> = vec![
            ("#a", None),
            ("#b", None),
            ("#c", None),
            ("#d", None),
            ("#e", None),
            ("#f", None),
            ("#k", Some("sekrit")),
        ];
        let (mut session, _bus, _obs) = session(&channels);
        session.on_line(":server 005 relay CHANTYPES=# :are supported");
        let out = session.take_outbound();
        assert_eq!(out[0], "JOIN #a,#b,#c,#d,#e");
        assert_eq!(out[1], "JOIN #f");
        assert_eq!(out[2], "JOIN #k sekrit");
        assert!(session.timers.is_scheduled(&IrcTimer::JoinSweep));

        // A later 005 must not restart the join sequence.
        session.on_line(":server 005 relay WHOX :are supported");
        assert!(session.take_outbound().is_empty());
    }

    #[tokio::test]
    async fn names_reply_builds_roster_with_status() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :@op +voice plain @+both");
        let chan = &session.chans["#lobby"];
        assert_eq!(chan.users["op"].status, "o");
        assert_eq!(chan.users["voice"].status, "v");
        assert_eq!(chan.users["plain"].status, "");
        assert_eq!(chan.users["both"].status, "ov");
    }

    #[tokio::test]
    async fn names_reply_handles_userhost_in_names() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :@Op!ident@host.example plain!p@elsewhere");
        let chan = &session.chans["#lobby"];
        assert_eq!(chan.users["op"].nick, "Op");
        assert_eq!(chan.users["op"].status, "o");
        assert!(chan.users.contains_key("plain"));
    }

    #[tokio::test]
    async fn end_of_names_issues_whox_query() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":server 366 relay #lobby :End of /NAMES list.");
        assert_eq!(session.take_outbound(), vec!["WHO #lobby %tna,696"]);
    }

    #[tokio::test]
    async fn whox_reply_sets_accounts() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :alice bob");
        session.on_line(":server 354 relay 696 alice accname");
        session.on_line(":server 354 relay 696 bob 0");
        let chan = &session.chans["#lobby"];
        assert_eq!(chan.users["alice"].account, "accname");
        assert_eq!(chan.users["bob"].account, "");
    }

    #[tokio::test]
    async fn nick_in_use_appends_numeric_suffix() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();
        session.on_line(":server 433 * relay :Nickname is already in use.");
        assert_eq!(session.take_outbound(), vec!["NICK relay0000"]);
        session.on_line(":server 433 * relay0000 :Nickname is already in use.");
        assert_eq!(session.take_outbound(), vec!["NICK relay0001"]);
    }

    #[tokio::test]
    async fn unrelated_nick_conflict_is_ignored() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();
        session.on_line(":server 433 someoneelse other :Nickname is already in use.");
        assert!(session.take_outbound().is_empty());
    }

    #[tokio::test]
    async fn mode_walker_updates_status_and_consumes_params() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :nick1 +nick2");

        session.on_line(":svc MODE #lobby +o-v nick1 nick2");
        let chan = &session.chans["#lobby"];
        assert_eq!(chan.users["nick1"].status, "o");
        assert_eq!(chan.users["nick2"].status, "");
    }

    #[tokio::test]
    async fn mode_walker_skips_class_params_correctly() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :alice");
        // +b consumes "ban!*@*" (class A), +l consumes "10" only because it
        // is being set (class C), then +o must pick up "alice".
        session.on_line(":svc MODE #lobby +blo ban!*@* 10 alice");
        assert_eq!(session.chans["#lobby"].users["alice"].status, "o");
        // -l consumes nothing, so -o applies to alice.
        session.on_line(":svc MODE #lobby -lo alice");
        assert_eq!(session.chans["#lobby"].users["alice"].status, "");
    }

    #[tokio::test]
    async fn kick_of_self_schedules_keyed_rejoin() {
        let (mut session, _bus, _obs) = session(&[("#vault", Some("sekrit"))]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #vault");
        assert!(session.chans["#vault"].joined);
        session.take_outbound();

        session.on_line(":op!o@host KICK #vault relay :out");
        assert!(!session.chans["#vault"].joined);
        assert!(session.timers.is_scheduled(&IrcTimer::Rejoin("#vault".into())));
        assert!(session.take_outbound().is_empty());

        session.on_timer(IrcTimer::Rejoin("#vault".into()));
        assert_eq!(session.take_outbound(), vec!["JOIN #vault sekrit"]);
    }

    #[tokio::test]
    async fn kick_of_other_removes_roster_entry() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":alice!a@host JOIN #lobby");
        session.on_line(":op!o@host KICK #lobby alice :bye");
        assert!(!session.chans["#lobby"].users.contains_key("alice"));
    }

    #[tokio::test]
    async fn part_of_self_rejoins_immediately() {
        let (mut session, _bus, _obs) = session(&[("#vault", Some("sekrit"))]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #vault");
        session.take_outbound();
        session.on_line(":relay!r@host PART #vault :oops");
        assert_eq!(session.take_outbound(), vec!["JOIN #vault sekrit"]);
    }

    #[tokio::test]
    async fn nick_change_renames_roster_keys() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":alice!a@host JOIN #lobby");
        session.on_line(":alice!a@host NICK Alicia");
        let chan = &session.chans["#lobby"];
        assert!(!chan.users.contains_key("alice"));
        assert_eq!(chan.users["alicia"].nick, "Alicia");
    }

    #[tokio::test]
    async fn own_nick_change_is_tracked() {
        let (mut session, _bus, _obs) = session(&[]);
        register(&mut session);
        session.on_line(":relay!r@host NICK relay2");
        assert_eq!(session.nick, "relay2");
    }

    #[tokio::test]
    async fn quit_and_kill_remove_from_all_channels() {
        let (mut session, _bus, _obs) = session(&[("#a", None), ("#b", None)]);
        register(&mut session);
        for chan in ["#a", "#b"] {
            session.on_line(&format!(":relay!r@host JOIN {chan}"));
            session.on_line(&format!(":alice!a@host JOIN {chan}"));
            session.on_line(&format!(":bob!b@host JOIN {chan}"));
        }
        session.on_line(":alice!a@host QUIT :gone");
        session.on_line(":svc KILL bob :bad");
        for chan in ["#a", "#b"] {
            assert!(!session.chans[chan].users.contains_key("alice"));
            assert!(!session.chans[chan].users.contains_key("bob"));
        }
    }

    #[tokio::test]
    async fn ping_is_answered_with_same_token() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_line("PING :12345");
        assert_eq!(session.take_outbound(), vec!["PONG 12345"]);
    }

    #[tokio::test]
    async fn keepalive_pings_then_gives_up() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();

        // Traffic was seen: the check sends an unsolicited PING.
        session.on_timer(IrcTimer::PingCheck);
        assert_eq!(session.take_outbound(), vec!["PING CHECKCONN"]);
        assert!(session.take_disconnect().is_none());

        // No traffic since: the connection is declared dead.
        session.on_timer(IrcTimer::PingCheck);
        assert_eq!(session.take_outbound(), vec!["QUIT :Ping Timeout"]);
        assert_eq!(session.take_disconnect().as_deref(), Some("Ping Timeout"));
    }

    #[tokio::test]
    async fn cap_negotiation_requests_supported_intersection() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();
        session.on_line(":server CAP * LS :away-notify sasl multi-prefix");
        assert_eq!(session.take_outbound(), vec!["CAP REQ :away-notify multi-prefix"]);
        assert!(session.timers.is_scheduled(&IrcTimer::CapFallback));

        // Fallback fires without an ACK: registration proceeds.
        session.on_timer(IrcTimer::CapFallback);
        assert_eq!(session.take_outbound(), vec!["CAP END"]);
    }

    #[tokio::test]
    async fn full_ack_ends_negotiation_immediately() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();
        session.on_line(":server CAP * LS :away-notify multi-prefix");
        session.take_outbound();
        session.on_line(":server CAP relay ACK :away-notify multi-prefix");
        assert_eq!(session.take_outbound(), vec!["CAP END"]);
        assert!(!session.timers.is_scheduled(&IrcTimer::CapFallback));

        // The safety-net timer firing later must not END twice.
        session.on_timer(IrcTimer::CapFallback);
        assert!(session.take_outbound().is_empty());
    }

    #[tokio::test]
    async fn second_cap_ls_cancels_previous_negotiation() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();
        session.on_line(":server CAP * LS :away-notify");
        session.take_outbound();
        session.on_line(":server CAP * LS :multi-prefix");
        assert_eq!(session.take_outbound(), vec!["CAP REQ multi-prefix"]);
        assert!(session.timers.is_scheduled(&IrcTimer::CapFallback));
    }

    #[tokio::test]
    async fn cap_ls_with_no_usable_caps_ends_at_once() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_connected();
        session.take_outbound();
        session.on_line(":server CAP * LS :sasl tls");
        assert_eq!(session.take_outbound(), vec!["CAP END"]);
    }

    #[tokio::test]
    async fn channel_message_is_broadcast_with_status_and_account() {
        let (mut session, _bus, mut obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :@alice");
        session.on_line(":server 354 relay 696 alice acct");

        session.on_line(":alice!a@host PRIVMSG #Lobby :hello world");
        let event = obs.try_recv().unwrap();
        assert_eq!(event.kind, kinds::CHANNEL_MESSAGE);
        assert_eq!(event.source, EndpointId::new("irc", "net1"));
        let payload: ChatPayload = event.payload_as().unwrap();
        assert_eq!(payload.target, "#lobby");
        assert_eq!(payload.message, "hello world");
        assert_eq!(payload.source.modes, "o");
        assert_eq!(payload.source.account, "acct");
    }

    #[tokio::test]
    async fn ctcp_action_is_classified_and_stripped() {
        let (mut session, _bus, mut obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":alice!a@host PRIVMSG #lobby :\u{1}ACTION waves\u{1}");
        let event = obs.try_recv().unwrap();
        assert_eq!(event.kind, kinds::CHANNEL_ACTION);
        let payload: ChatPayload = event.payload_as().unwrap();
        assert_eq!(payload.message, "waves");
    }

    #[tokio::test]
    async fn unjoined_channel_messages_are_not_relayed() {
        let (mut session, _bus, mut obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":alice!a@host PRIVMSG #lobby :hello");
        assert!(obs.try_recv().is_err());
    }

    #[tokio::test]
    async fn private_message_emits_user_event() {
        let (mut session, _bus, mut obs) = session(&[]);
        register(&mut session);
        session.on_line(":alice!a@host PRIVMSG relay :psst");
        let event = obs.try_recv().unwrap();
        assert_eq!(event.kind, kinds::USER_MESSAGE);
        let payload: ChatPayload = event.payload_as().unwrap();
        assert_eq!(payload.target, "relay");
        assert_eq!(payload.message, "psst");
    }

    #[tokio::test]
    async fn ctcp_version_is_answered_directly() {
        let (mut session, _bus, _obs) = session(&[]);
        register(&mut session);
        session.on_line(":alice!a@host PRIVMSG relay :\u{1}VERSION\u{1}");
        let out = session.take_outbound();
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("NOTICE alice :\u{1}VERSION relaybot"));
    }

    #[tokio::test]
    async fn ops_command_is_answered_for_operators_only() {
        let (mut session, _bus, mut obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :@alice bob");

        session.on_line(":alice!a@host PRIVMSG #lobby :?ops");
        assert_eq!(session.take_outbound(), vec!["PRIVMSG #lobby :Ops: alice"]);
        assert!(obs.try_recv().is_err());

        // Non-operator: command is not recognized, message is relayed.
        session.on_line(":bob!b@host PRIVMSG #lobby :?ops");
        assert!(session.take_outbound().is_empty());
        assert!(obs.try_recv().is_ok());
    }

    #[tokio::test]
    async fn account_command_reports_roster_knowledge() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":server 353 relay = #lobby :@alice bob");
        session.on_line(":server 354 relay 696 bob bobacct");

        session.on_line(":alice!a@host PRIVMSG #lobby :?account bob");
        assert_eq!(
            session.take_outbound(),
            vec!["PRIVMSG #lobby :bob is logged in as bobacct"]
        );
        session.on_line(":alice!a@host PRIVMSG #lobby :?account ghost");
        assert_eq!(
            session.take_outbound(),
            vec!["PRIVMSG #lobby :There is no user named ghost"]
        );
    }

    #[tokio::test]
    async fn extended_join_and_account_notify_update_accounts() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.on_line(":alice!a@host JOIN #lobby acct :Alice");
        assert_eq!(session.chans["#lobby"].users["alice"].account, "acct");

        session.on_line(":alice!a@host ACCOUNT *");
        assert_eq!(session.chans["#lobby"].users["alice"].account, "");
    }

    #[tokio::test]
    async fn sendcmd_event_is_transmitted_verbatim() {
        let (mut session, _bus, _obs) = session(&[]);
        let event = Event::new(
            kinds::IRC_SENDCMD,
            EndpointId::new("relay", "relay"),
            Protocol::Irc,
            serde_json::json!({"command": "PRIVMSG #lobby :from the game"}),
        );
        session.handle_event(&event);
        assert_eq!(session.take_outbound(), vec!["PRIVMSG #lobby :from the game"]);

        // Other event kinds are ignored.
        let other = Event::new(
            kinds::CHANNEL_MESSAGE,
            EndpointId::new("relay", "relay"),
            Protocol::Udp,
            serde_json::json!({}),
        );
        session.handle_event(&other);
        assert!(session.take_outbound().is_empty());
    }

    #[tokio::test]
    async fn error_message_is_captured_for_the_disconnect_log() {
        let (mut session, _bus, _obs) = session(&[]);
        session.on_line("ERROR :Closing link (banned)");
        assert_eq!(session.error_msg.as_deref(), Some("Closing link (banned)"));
    }

    #[tokio::test]
    async fn rejoin_timer_noop_when_already_joined() {
        let (mut session, _bus, _obs) = session(&[("#lobby", None)]);
        register(&mut session);
        session.on_line(":relay!r@host JOIN #lobby");
        session.take_outbound();
        session.on_timer(IrcTimer::Rejoin("#lobby".into()));
        assert!(session.take_outbound().is_empty());
    }
}
