//! Merging server-confirmed messages into a transcript that may hold
//! optimistic (pending) sends.
//!
//! A confirmed message that echoes a `client_token` is matched by token
//! only. Without a token the pending entry must agree on both the send
//! timestamp (millisecond precision) and the body; two empty bodies agree,
//! so attachment-only sends reconcile too.

use parley_core::messages::{truncate_millis, Message};

/// Where a confirmed message landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Replaced the pending entry at this index.
    Replaced(usize),
    Appended,
}

/// Index of the pending entry `confirmed` confirms, if any.
pub fn find_pending(messages: &[Message], confirmed: &Message) -> Option<usize> {
    if let Some(token) = &confirmed.client_token {
        return messages
            .iter()
            .position(|m| m.is_pending() && m.client_token.as_ref() == Some(token));
    }

    let sent_at = truncate_millis(confirmed.sent_at?);
    messages.iter().position(|m| {
        m.is_pending()
            && m.sent_at.map(truncate_millis) == Some(sent_at)
            && bodies_match(m, confirmed)
    })
}

fn bodies_match(a: &Message, b: &Message) -> bool {
    match (a.has_empty_body(), b.has_empty_body()) {
        (true, true) => true,
        (false, false) => a.body == b.body,
        _ => false,
    }
}

/// Replace the matching pending entry in place, or append.
pub fn reconcile(messages: &mut Vec<Message>, confirmed: Message) -> Reconciled {
    match find_pending(messages, &confirmed) {
        Some(idx) => {
            messages[idx] = confirmed;
            Reconciled::Replaced(idx)
        }
        None => {
            messages.push(confirmed);
            Reconciled::Appended
        }
    }
}

/// Stable ascending sort by creation time; entries without one keep their
/// relative order after the confirmed ones.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use parley_core::ids::ClientToken;
    use parley_core::messages::MessageType;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn pending(body: Option<&str>, sent: DateTime<Utc>) -> Message {
        Message::customer(body.map(String::from), vec![], None, sent)
    }

    /// What the server echoes for `p` when it drops the client token.
    fn confirm(p: &Message) -> Message {
        let mut m = p.clone();
        m.client_token = None;
        m.created_at = Some(p.sent_at.unwrap() + Duration::milliseconds(40));
        m
    }

    fn agent(body: &str, at: DateTime<Utc>) -> Message {
        let mut m = Message::bot(body, at);
        m.message_type = MessageType::Agent;
        m.customer_id = None;
        m
    }

    #[test]
    fn replaces_pending_in_place() {
        let p = pending(Some("hi"), t(0));
        let mut messages = vec![agent("welcome", t(-10)), p.clone(), pending(Some("later"), t(5))];

        let outcome = reconcile(&mut messages, confirm(&p));
        assert_eq!(outcome, Reconciled::Replaced(1));
        assert_eq!(messages.len(), 3);
        assert!(messages[1].is_confirmed());
        assert!(messages[2].is_pending());
    }

    #[test]
    fn unmatched_is_appended() {
        let mut messages = vec![pending(Some("hi"), t(0))];
        let outcome = reconcile(&mut messages, agent("hello from support", t(100)));
        assert_eq!(outcome, Reconciled::Appended);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_pending());
    }

    #[test]
    fn same_timestamp_different_body_not_merged() {
        let a = pending(Some("first"), t(0));
        let b = pending(Some("second"), t(0));
        let mut messages = vec![a.clone(), b.clone()];

        assert_eq!(reconcile(&mut messages, confirm(&b)), Reconciled::Replaced(1));
        assert_eq!(reconcile(&mut messages, confirm(&a)), Reconciled::Replaced(0));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body.as_deref(), Some("first"));
        assert_eq!(messages[1].body.as_deref(), Some("second"));
    }

    #[test]
    fn attachment_only_messages_match() {
        let mut p = pending(None, t(0));
        p.file_ids = vec!["f1".into()];
        let mut c = confirm(&p);
        c.body = Some(String::new());
        let mut messages = vec![p];

        assert_eq!(reconcile(&mut messages, c), Reconciled::Replaced(0));
    }

    #[test]
    fn empty_vs_non_empty_body_not_matched() {
        let p = pending(None, t(0));
        let mut c = confirm(&p);
        c.body = Some("text".into());
        assert!(find_pending(&[p], &c).is_none());
    }

    #[test]
    fn timestamp_compared_at_millis() {
        let p = pending(Some("hi"), t(0));
        let mut c = confirm(&p);
        c.sent_at = Some(p.sent_at.unwrap() + Duration::microseconds(300));
        assert_eq!(find_pending(&[p], &c), Some(0));
    }

    #[test]
    fn confirmed_entries_are_never_replaced() {
        let p = pending(Some("hi"), t(0));
        let c = confirm(&p);
        let mut messages = vec![c.clone()];
        assert_eq!(reconcile(&mut messages, c), Reconciled::Appended);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn token_match_wins_over_heuristic() {
        let a = pending(Some("same"), t(0));
        let b = pending(Some("same"), t(0));
        let mut echoed = b.clone();
        echoed.created_at = Some(t(50));
        let mut messages = vec![a, b];

        assert_eq!(reconcile(&mut messages, echoed), Reconciled::Replaced(1));
        assert!(messages[0].is_pending());
    }

    #[test]
    fn unknown_token_appends() {
        let p = pending(Some("hi"), t(0));
        let mut other_tab = confirm(&p);
        other_tab.client_token = Some(ClientToken::new());
        let mut messages = vec![p];

        assert_eq!(reconcile(&mut messages, other_tab), Reconciled::Appended);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn sorts_by_created_at() {
        let mut messages = vec![agent("b", t(20)), agent("a", t(10)), agent("c", t(30))];
        sort_chronologically(&mut messages);
        let bodies: Vec<_> = messages.iter().map(|m| m.text()).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
    }
}
