use crate::error::{Result, TallyError};
use crate::transport::ParticipantLink;
use metrics::{counter, gauge};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tally_common::turn_owner;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registry key assigned in connection order
pub type ParticipantKey = u64;

/// A reachable participant and its outbound link
pub struct Participant {
    pub key: ParticipantKey,
    /// Id announced with `JOIN:<id>`, if any
    pub claimed_id: Option<u32>,
    pub registered_at: Instant,
    link: Box<dyn ParticipantLink>,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub pruned: Vec<ParticipantKey>,
}

struct RegistryInner {
    participants: BTreeMap<ParticipantKey, Participant>,
    next_key: ParticipantKey,
}

/// Currently reachable participants behind one registry-wide lock.
///
/// Membership changes and whole fan-outs run under the same acquisition, so
/// a broadcast never sees a torn registry.
pub struct ParticipantRegistry {
    inner: Mutex<RegistryInner>,
    live: AtomicUsize,
    ever_registered: AtomicBool,
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                participants: BTreeMap::new(),
                next_key: 0,
            }),
            live: AtomicUsize::new(0),
            ever_registered: AtomicBool::new(false),
        }
    }

    /// Register a link and return its key
    pub async fn register(&self, link: Box<dyn ParticipantLink>) -> ParticipantKey {
        let mut inner = self.inner.lock().await;
        let key = inner.next_key;
        inner.next_key += 1;

        info!(participant = key, peer = %link.describe(), "Participant registered");
        inner.participants.insert(
            key,
            Participant {
                key,
                claimed_id: None,
                registered_at: Instant::now(),
                link,
            },
        );
        self.ever_registered.store(true, Ordering::SeqCst);
        self.update_live(inner.participants.len());
        key
    }

    /// Record the id a participant announced
    pub async fn set_identity(&self, key: ParticipantKey, id: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let participant = inner
            .participants
            .get_mut(&key)
            .ok_or(TallyError::UnknownParticipant(key))?;

        if let Some(previous) = participant.claimed_id.replace(id) {
            if previous != id {
                warn!(participant = key, previous, id, "Participant changed its claimed id");
            }
        }
        debug!(participant = key, id, "Participant identity recorded");
        Ok(())
    }

    /// Turn the participant claims to own: its announced id, or its key mod N
    pub async fn claimed_owner(&self, key: ParticipantKey, participants: u32) -> Option<u32> {
        let inner = self.inner.lock().await;
        inner.participants.get(&key).map(|p| {
            p.claimed_id
                .unwrap_or_else(|| turn_owner(key as i64, participants))
        })
    }

    /// Remove a participant and close its link. Returns false if it was
    /// already gone.
    pub async fn remove(&self, key: ParticipantKey) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.participants.remove(&key);
        self.update_live(inner.participants.len());
        drop(inner);

        match removed {
            Some(mut participant) => {
                participant.link.close().await;
                info!(participant = key, "Participant removed");
                true
            }
            None => false,
        }
    }

    /// Send `text` to every participant, pruning those whose send fails
    pub async fn fan_out(&self, text: &str) -> FanOut {
        let mut inner = self.inner.lock().await;
        let mut report = FanOut::default();

        for (key, participant) in inner.participants.iter_mut() {
            match participant.link.send(text).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(participant = *key, error = %e, "Send failed, pruning participant");
                    report.pruned.push(*key);
                }
            }
        }

        for key in &report.pruned {
            if let Some(mut participant) = inner.participants.remove(key) {
                participant.link.close().await;
                counter!("tally_participants_pruned_total", 1);
                warn!(participant = *key, "Participant pruned after send failure");
            }
        }
        self.update_live(inner.participants.len());

        report
    }

    /// Send `text` to one participant, pruning it on failure
    pub async fn send_to(&self, key: ParticipantKey, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let participant = inner
            .participants
            .get_mut(&key)
            .ok_or(TallyError::UnknownParticipant(key))?;

        if let Err(e) = participant.link.send(text).await {
            if let Some(mut participant) = inner.participants.remove(&key) {
                participant.link.close().await;
            }
            self.update_live(inner.participants.len());
            counter!("tally_participants_pruned_total", 1);
            warn!(participant = key, error = %e, "Participant pruned after send failure");
            return Err(TallyError::Io(e));
        }
        Ok(())
    }

    /// Close and drop every link
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        let participants = std::mem::take(&mut inner.participants);
        self.update_live(0);
        drop(inner);

        let count = participants.len();
        for (_, mut participant) in participants {
            participant.link.close().await;
        }
        if count > 0 {
            info!(closed = count, "Closed all participant links");
        }
    }

    /// Keys of all registered participants in connection order
    pub async fn keys(&self) -> Vec<ParticipantKey> {
        self.inner.lock().await.participants.keys().copied().collect()
    }

    /// Number of registered participants
    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any participant has registered since start
    pub fn ever_registered(&self) -> bool {
        self.ever_registered.load(Ordering::SeqCst)
    }

    fn update_live(&self, len: usize) {
        self.live.store(len, Ordering::SeqCst);
        gauge!("tally_participants", len as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelLink;

    #[tokio::test]
    async fn test_register_assigns_sequential_keys() {
        let registry = ParticipantRegistry::new();
        assert!(!registry.ever_registered());

        let (a, _rx_a) = ChannelLink::pair("a");
        let (b, _rx_b) = ChannelLink::pair("b");
        assert_eq!(registry.register(Box::new(a)).await, 0);
        assert_eq!(registry.register(Box::new(b)).await, 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.ever_registered());
    }

    #[tokio::test]
    async fn test_fan_out_prunes_exactly_the_failed_participant() {
        let registry = ParticipantRegistry::new();
        let (a, mut rx_a) = ChannelLink::pair("a");
        let (b, rx_b) = ChannelLink::pair("b");
        let (c, mut rx_c) = ChannelLink::pair("c");
        registry.register(Box::new(a)).await;
        let failed = registry.register(Box::new(b)).await;
        registry.register(Box::new(c)).await;
        drop(rx_b);

        let report = registry.fan_out("7\n").await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![failed]);
        assert_eq!(registry.keys().await, vec![0, 2]);

        let report = registry.fan_out("8\n").await;
        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());

        assert_eq!(rx_a.recv().await.as_deref(), Some("7\n"));
        assert_eq!(rx_a.recv().await.as_deref(), Some("8\n"));
        assert_eq!(rx_c.recv().await.as_deref(), Some("7\n"));
    }

    #[tokio::test]
    async fn test_claimed_owner_defaults_to_key() {
        let registry = ParticipantRegistry::new();
        let (a, _rx_a) = ChannelLink::pair("a");
        let (b, _rx_b) = ChannelLink::pair("b");
        let first = registry.register(Box::new(a)).await;
        let second = registry.register(Box::new(b)).await;

        assert_eq!(registry.claimed_owner(second, 3).await, Some(1));
        registry.set_identity(second, 2).await.expect("registered");
        assert_eq!(registry.claimed_owner(second, 3).await, Some(2));
        assert_eq!(registry.claimed_owner(first, 3).await, Some(0));
        assert_eq!(registry.claimed_owner(99, 3).await, None);
    }

    #[tokio::test]
    async fn test_remove_closes_link() {
        let registry = ParticipantRegistry::new();
        let (a, mut rx_a) = ChannelLink::pair("a");
        let key = registry.register(Box::new(a)).await;

        assert!(registry.remove(key).await);
        assert!(!registry.remove(key).await);
        assert!(registry.is_empty());
        assert_eq!(rx_a.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_to_unknown_participant() {
        let registry = ParticipantRegistry::new();
        let err = registry.send_to(4, "1\n").await.expect_err("unknown");
        assert!(matches!(err, TallyError::UnknownParticipant(4)));
    }
}
