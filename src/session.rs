//! Per-room transcript buffers.
//!
//! A [`Session`] owns the formatted message log of one room and mediates
//! three writers racing over it: the one-shot history backfill, live
//! message events, and post-ack history merges. Readers on the filesystem
//! side block on a condition variable until the first backfill lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};

use crate::client::{HistoryPage, HistoryParams, Link, Message};
use crate::error::Error;

/// The timestamp of an empty session.
pub const EMPTY_TS: &str = "0000000000.000000";

/// Marker rendered on the boundary between prior context and the current
/// session.
pub const SESSION_MARKER: &[u8] = b"# current session begins here\n";

/// How long an outgoing message may sit unacknowledged before its ack slot
/// is reclaimed.
const ACK_TTL: Duration = Duration::from_secs(60);

/// Resolves a user id to a display name. Implemented by the user set.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, user_id: &str) -> Option<String>;
}

/// Counters for known gaps, shared across all sessions of a connection.
#[derive(Debug, Default)]
pub struct Stats {
    /// History responses that reported more messages than one page; the
    /// remainder is not fetched.
    pub truncated_fetches: AtomicU64,
}

struct State {
    initialized: bool,
    shutdown: bool,
    formatted: Vec<u8>,
    newest_ts: String,
    marker_done: bool,
    acks: HashMap<u64, Instant>,
}

/// The transcript buffer and outbound ack tracker of one room.
pub struct Session {
    room_id: String,
    last_read: String,
    latest_ts: String,
    fetch_count: u32,
    users: Arc<dyn NameResolver>,
    link: Option<Link>,
    stats: Arc<Stats>,
    fetch_started: AtomicBool,

    state: Mutex<State>,
    cond: Condvar,
}

impl Session {
    pub fn new(
        room_id: &str,
        last_read: &str,
        latest_ts: &str,
        unread_count: u32,
        users: Arc<dyn NameResolver>,
        link: Option<Link>,
        stats: Arc<Stats>,
    ) -> Arc<Session> {
        Arc::new(Session {
            room_id: room_id.to_owned(),
            last_read: last_read.to_owned(),
            latest_ts: latest_ts.to_owned(),
            fetch_count: (unread_count + 100).min(1000),
            users,
            link,
            stats,
            fetch_started: AtomicBool::new(false),
            state: Mutex::new(State {
                initialized: false,
                shutdown: false,
                formatted: Vec::new(),
                newest_ts: EMPTY_TS.to_owned(),
                marker_done: false,
                acks: HashMap::new(),
            }),
            cond: Condvar::new(),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Kick off the one-shot history backfill in the background. Subsequent
    /// calls (e.g. a room re-opening) are no-ops, as is offline mode.
    pub fn spawn_initial_fetch(self: &Arc<Self>) {
        if self.link.is_none() {
            return;
        }
        if self.fetch_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("history-{}", session.room_id))
            .spawn(move || session.initial_fetch())
            .expect("spawn history fetch");
    }

    fn initial_fetch(&self) {
        let link = match &self.link {
            Some(link) => link,
            None => return,
        };
        let params = HistoryParams {
            oldest: None,
            latest: (!self.latest_ts.is_empty()).then(|| self.latest_ts.clone()),
            count: self.fetch_count,
            inclusive: true,
        };
        match link.history.fetch(&self.room_id, &params) {
            Ok(page) => self.merge_history(page, true),
            Err(err) => {
                tracing::warn!(room = %self.room_id, %err, "history fetch failed");
                // Readers must not hang on a failed backfill.
                let mut st = self.state.lock().unwrap();
                st.initialized = true;
                self.cond.notify_all();
            }
        }
    }

    /// Append a page of history. `initial` marks the one-shot backfill,
    /// which also places the session marker and flips `initialized`.
    fn merge_history(&self, page: HistoryPage, initial: bool) {
        if page.has_more {
            self.stats.truncated_fetches.fetch_add(1, Ordering::Relaxed);
            // TODO: page through the remainder instead of truncating.
            tracing::warn!(room = %self.room_id, "history truncated to one page");
        }

        let mut messages = page.messages;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut st = self.state.lock().unwrap();
        for msg in &messages {
            // A merge after an ack overlaps whatever was already appended;
            // everything at or before newest_ts is in the buffer already.
            if !initial && msg.timestamp.as_str() <= st.newest_ts.as_str() {
                continue;
            }
            if let Some(line) = self.render_line(msg) {
                st.formatted.extend_from_slice(&line);
            }
            if initial
                && !st.marker_done
                && !self.last_read.is_empty()
                && msg.timestamp == self.last_read
            {
                st.formatted.extend_from_slice(SESSION_MARKER);
                st.marker_done = true;
            }
        }
        if let Some(last) = messages.last() {
            if last.timestamp.as_str() > st.newest_ts.as_str() {
                st.newest_ts = last.timestamp.clone();
            }
        }
        if initial {
            st.initialized = true;
        }
        self.cond.notify_all();
    }

    /// Append one live message. Blocks until the history backfill has
    /// landed, and drops anything that overlaps it.
    pub fn live_message(&self, msg: &Message) {
        let mut st = self.state.lock().unwrap();
        while !st.initialized {
            if st.shutdown {
                return;
            }
            tracing::debug!(room = %self.room_id, "holding live message until history is in");
            st = self.cond.wait(st).unwrap();
        }
        if msg.timestamp.as_str() <= st.newest_ts.as_str() {
            tracing::warn!(
                room = %self.room_id,
                ts = %msg.timestamp,
                "dropping live message older than transcript"
            );
            return;
        }
        if let Some(line) = self.render_line(msg) {
            st.formatted.extend_from_slice(&line);
        }
        st.newest_ts = msg.timestamp.clone();
        self.cond.notify_all();
    }

    /// Current transcript length. Blocks until initialized.
    pub fn curr_len(&self) -> Result<u64, Error> {
        let mut st = self.state.lock().unwrap();
        while !st.initialized {
            if st.shutdown {
                return Err(Error::Interrupted);
            }
            st = self.cond.wait(st).unwrap();
        }
        Ok(st.formatted.len() as u64)
    }

    /// A slice of the transcript, clamped to the current length. Blocks
    /// until initialized.
    pub fn bytes(&self, offset: u64, size: usize) -> Result<Vec<u8>, Error> {
        let mut st = self.state.lock().unwrap();
        while !st.initialized {
            if st.shutdown {
                return Err(Error::Interrupted);
            }
            st = self.cond.wait(st).unwrap();
        }
        let len = st.formatted.len() as u64;
        if offset > len {
            return Err(Error::OffsetOutOfRange { offset, len });
        }
        let start = offset as usize;
        let end = start.saturating_add(size).min(st.formatted.len());
        Ok(st.formatted[start..end].to_vec())
    }

    /// Post the payload of a `write` file: trim and send.
    pub fn write(&self, payload: &[u8]) -> Result<(), Error> {
        let text = String::from_utf8_lossy(payload);
        self.send_text(text.trim())
    }

    /// Post the payload of a `write.pre` file: trim, fence, send.
    pub fn write_fenced(&self, payload: &[u8]) -> Result<(), Error> {
        let text = String::from_utf8_lossy(payload);
        self.send_text(&format!("```{}```", text.trim()))
    }

    fn send_text(&self, text: &str) -> Result<(), Error> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".into()))?;

        // The outbox invokes the callback with the freshly allocated id
        // before transmitting, under its own lock; the id is in `acks` by
        // the time the server can possibly acknowledge it.
        let sent = link.outbox.send(&self.room_id, text, &mut |id| {
            let mut st = self.state.lock().unwrap();
            Self::evict_stale_acks(&self.room_id, &mut st.acks);
            st.acks.insert(id, Instant::now());
        });
        if let Err(err) = sent {
            tracing::warn!(room = %self.room_id, %err, "send failed");
        }
        Ok(())
    }

    /// Handle a server ack. Returns false if the acked id is not ours.
    ///
    /// A recognized ack triggers a history fetch from the acked timestamp
    /// onward, so the transcript picks up the server-rendered form of the
    /// message we sent together with anything that interleaved.
    pub fn on_ack(&self, reply_to: u64, timestamp: &str) -> bool {
        let known = {
            let mut st = self.state.lock().unwrap();
            Self::evict_stale_acks(&self.room_id, &mut st.acks);
            st.acks.remove(&reply_to).is_some()
        };
        if !known {
            return false;
        }

        if let Some(link) = &self.link {
            let params = HistoryParams {
                oldest: Some(timestamp.to_owned()),
                latest: None,
                count: 1000,
                inclusive: true,
            };
            match link.history.fetch(&self.room_id, &params) {
                Ok(page) => self.merge_history(page, false),
                Err(err) => {
                    tracing::warn!(room = %self.room_id, %err, "post-ack history fetch failed")
                }
            }
        }
        true
    }

    /// Wake all blocked readers with `Interrupted`. Called at unmount.
    pub fn interrupt(&self) {
        let mut st = self.state.lock().unwrap();
        st.shutdown = true;
        self.cond.notify_all();
    }

    fn evict_stale_acks(room_id: &str, acks: &mut HashMap<u64, Instant>) {
        acks.retain(|id, registered| {
            if registered.elapsed() > ACK_TTL {
                tracing::warn!(room = %room_id, id, "evicting unacknowledged outgoing message");
                false
            } else {
                true
            }
        });
    }

    /// Render one transcript line: `<time>\t<user>\t<text>\n`. A message
    /// whose timestamp does not parse is logged and skipped.
    fn render_line(&self, msg: &Message) -> Option<Vec<u8>> {
        let when = match format_ts(&msg.timestamp) {
            Some(when) => when,
            None => {
                tracing::warn!(room = %self.room_id, ts = %msg.timestamp, "unrenderable timestamp");
                return None;
            }
        };
        let user = self
            .users
            .resolve(&msg.user)
            .unwrap_or_else(|| format!("<unknown|{}>", msg.user));
        Some(format!("{}\t{}\t{}\n", when, user, msg.text).into_bytes())
    }
}

/// Format a decimal seconds-since-epoch timestamp as local time.
fn format_ts(ts: &str) -> Option<String> {
    let (sec, nsec) = parse_ts(ts)?;
    let when = Local.timestamp_opt(sec, nsec).single()?;
    Some(when.format("%b %d %H:%M:%S").to_string())
}

fn parse_ts(ts: &str) -> Option<(i64, u32)> {
    let (sec, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let sec = sec.parse::<i64>().ok()?;
    if frac.is_empty() {
        return Some((sec, 0));
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut digits = frac.to_owned();
    digits.truncate(9);
    while digits.len() < 9 {
        digits.push('0');
    }
    Some((sec, digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Roster(HashMap<String, String>);

    impl Roster {
        fn of(pairs: &[(&str, &str)]) -> Arc<Roster> {
            Arc::new(Roster(
                pairs
                    .iter()
                    .map(|(id, name)| (id.to_string(), name.to_string()))
                    .collect(),
            ))
        }
    }

    impl NameResolver for Roster {
        fn resolve(&self, user_id: &str) -> Option<String> {
            self.0.get(user_id).cloned()
        }
    }

    struct QueuedHistory {
        pages: Mutex<Vec<HistoryPage>>,
        requests: Mutex<Vec<HistoryParams>>,
    }

    impl QueuedHistory {
        fn new(pages: Vec<HistoryPage>) -> Arc<QueuedHistory> {
            Arc::new(QueuedHistory {
                pages: Mutex::new(pages),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl crate::client::History for QueuedHistory {
        fn fetch(&self, _room_id: &str, params: &HistoryParams) -> Result<HistoryPage, Error> {
            self.requests.lock().unwrap().push(params.clone());
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Err(Error::Transport("no more pages".into()))
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    #[derive(Default)]
    struct RecordingOutbox {
        next_id: Mutex<u64>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl crate::client::Outbox for RecordingOutbox {
        fn send(
            &self,
            room_id: &str,
            text: &str,
            register: &mut dyn FnMut(u64),
        ) -> Result<u64, Error> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            register(*next);
            self.sent
                .lock()
                .unwrap()
                .push((room_id.to_owned(), text.to_owned()));
            Ok(*next)
        }
    }

    fn msg(ts: &str, user: &str, text: &str) -> Message {
        Message {
            channel: String::new(),
            user: user.to_owned(),
            text: text.to_owned(),
            timestamp: ts.to_owned(),
        }
    }

    fn link(history: Arc<QueuedHistory>, outbox: Arc<RecordingOutbox>) -> Link {
        Link {
            history,
            outbox,
        }
    }

    fn lines(session: &Session) -> Vec<String> {
        let len = session.curr_len().unwrap();
        let buf = session.bytes(0, len as usize).unwrap();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn backfill_sorts_and_marks_the_boundary() {
        let history = QueuedHistory::new(vec![HistoryPage {
            messages: vec![
                msg("1425012345.000001", "U01", "first"),
                msg("1425012345.000003", "U01", "third"),
                msg("1425012345.000002", "U01", "second"),
            ],
            has_more: false,
        }]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "1425012345.000001",
            "1425012345.000003",
            0,
            Roster::of(&[("U01", "alice")]),
            Some(link(history, outbox)),
            Arc::new(Stats::default()),
        );

        session.spawn_initial_fetch();

        let lines = lines(&session);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("\talice\tfirst"));
        assert_eq!(lines[1], "# current session begins here");
        assert!(lines[2].ends_with("\talice\tsecond"));
        assert!(lines[3].ends_with("\talice\tthird"));
    }

    #[test]
    fn zero_history_initializes_empty() {
        let history = QueuedHistory::new(vec![HistoryPage::default()]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[]),
            Some(link(history, outbox)),
            Arc::new(Stats::default()),
        );
        session.spawn_initial_fetch();

        assert_eq!(session.curr_len().unwrap(), 0);
        assert!(session.bytes(0, 64).unwrap().is_empty());
    }

    #[test]
    fn failed_backfill_still_releases_readers() {
        let history = QueuedHistory::new(vec![]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[]),
            Some(link(history, outbox)),
            Arc::new(Stats::default()),
        );
        session.spawn_initial_fetch();
        assert_eq!(session.curr_len().unwrap(), 0);
    }

    #[test]
    fn live_messages_append_and_dedup_against_history() {
        let history = QueuedHistory::new(vec![HistoryPage {
            messages: vec![msg("1425012345.000005", "U01", "hi")],
            has_more: false,
        }]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "1425012345.000005",
            0,
            Roster::of(&[("U01", "alice")]),
            Some(link(history, outbox)),
            Arc::new(Stats::default()),
        );
        session.spawn_initial_fetch();
        let baseline = session.curr_len().unwrap();

        // Overlaps the backfill: dropped.
        session.live_message(&msg("1425012345.000005", "U01", "hi"));
        assert_eq!(session.curr_len().unwrap(), baseline);

        session.live_message(&msg("1425012345.000007", "U01", "newer"));
        let curr_lines = lines(&session);
        assert_eq!(curr_lines.len(), 2);
        assert!(curr_lines[1].ends_with("\talice\tnewer"));

        // Out-of-order stragglers are dropped too.
        session.live_message(&msg("1425012345.000006", "U01", "late"));
        assert_eq!(lines(&session).len(), 2);
    }

    #[test]
    fn unknown_users_render_with_a_placeholder() {
        let history = QueuedHistory::new(vec![HistoryPage {
            messages: vec![msg("1425012345.000001", "U99", "who")],
            has_more: false,
        }]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[]),
            Some(link(history, outbox)),
            Arc::new(Stats::default()),
        );
        session.spawn_initial_fetch();
        assert!(lines(&session)[0].contains("\t<unknown|U99>\t"));
    }

    #[test]
    fn bytes_is_clamped_and_rejects_offsets_past_the_end() {
        let history = QueuedHistory::new(vec![HistoryPage {
            messages: vec![msg("1425012345.000001", "U01", "hi")],
            has_more: false,
        }]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[("U01", "alice")]),
            Some(link(history, outbox)),
            Arc::new(Stats::default()),
        );
        session.spawn_initial_fetch();

        let len = session.curr_len().unwrap();
        assert!(session.bytes(len, 16).unwrap().is_empty());
        assert!(matches!(
            session.bytes(len + 1, 16),
            Err(Error::OffsetOutOfRange { .. })
        ));
        assert_eq!(session.bytes(0, usize::MAX).unwrap().len() as u64, len);
    }

    #[test]
    fn ack_triggers_an_inclusive_fetch_from_the_acked_timestamp() {
        let history = QueuedHistory::new(vec![
            HistoryPage::default(),
            HistoryPage {
                messages: vec![msg("1425012346.000001", "U01", "hello")],
                has_more: false,
            },
        ]);
        let requests = history.clone();
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[("U01", "alice")]),
            Some(link(history, outbox.clone())),
            Arc::new(Stats::default()),
        );
        session.spawn_initial_fetch();
        session.curr_len().unwrap();

        session.write(b"  hello \n").unwrap();
        assert_eq!(
            outbox.sent.lock().unwrap()[0],
            ("C001".to_owned(), "hello".to_owned())
        );

        // Unknown ids are not ours.
        assert!(!session.on_ack(999, "1425012346.000001"));

        assert!(session.on_ack(1, "1425012346.000001"));
        let lines = lines(&session);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("\talice\thello"));

        let reqs = requests.requests.lock().unwrap();
        let followup = reqs.last().unwrap();
        assert_eq!(followup.oldest.as_deref(), Some("1425012346.000001"));
        assert_eq!(followup.count, 1000);
        assert!(followup.inclusive);

        // A second ack for the same id is no longer recognized.
        assert!(!session.on_ack(1, "1425012346.000001"));
    }

    #[test]
    fn fenced_writes_wrap_the_payload() {
        let history = QueuedHistory::new(vec![HistoryPage::default()]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[]),
            Some(link(history, outbox.clone())),
            Arc::new(Stats::default()),
        );
        session.write_fenced(b"let x = 1\n").unwrap();
        assert_eq!(
            outbox.sent.lock().unwrap()[0].1,
            "```let x = 1```".to_owned()
        );
    }

    #[test]
    fn offline_writes_fail() {
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[]),
            None,
            Arc::new(Stats::default()),
        );
        assert!(matches!(session.write(b"hi"), Err(Error::Transport(..))));
    }

    #[test]
    fn interrupt_releases_blocked_readers() {
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[]),
            None,
            Arc::new(Stats::default()),
        );
        let reader = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.curr_len())
        };
        std::thread::sleep(Duration::from_millis(50));
        session.interrupt();
        assert!(matches!(reader.join().unwrap(), Err(Error::Interrupted)));
    }

    #[test]
    fn truncated_history_is_counted() {
        let stats = Arc::new(Stats::default());
        let history = QueuedHistory::new(vec![HistoryPage {
            messages: vec![msg("1425012345.000001", "U01", "hi")],
            has_more: true,
        }]);
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            "C001",
            "",
            "",
            0,
            Roster::of(&[("U01", "alice")]),
            Some(link(history, outbox)),
            stats.clone(),
        );
        session.spawn_initial_fetch();
        session.curr_len().unwrap();
        assert_eq!(stats.truncated_fetches.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn timestamps_parse_with_microsecond_fractions() {
        assert_eq!(parse_ts("1425012345.000005"), Some((1425012345, 5000)));
        assert_eq!(parse_ts("1425012345"), Some((1425012345, 0)));
        assert_eq!(parse_ts("0000000000.000000"), Some((0, 0)));
        assert_eq!(parse_ts("not-a-ts"), None);
        assert_eq!(parse_ts("1425012345.00000x"), None);
    }

    #[test]
    fn rendered_lines_carry_timestamp_user_and_text() {
        let rendered = format!(
            "{}\talice\thi there\n",
            format_ts("1425012345.000005").unwrap()
        );
        let mut fields = rendered.trim_end().splitn(3, '\t');
        let when = fields.next().unwrap();
        assert_eq!(when, format_ts("1425012345.000005").unwrap());
        assert_eq!(fields.next(), Some("alice"));
        assert_eq!(fields.next(), Some("hi there"));
    }
}
