//! Data-channel heartbeat: the demo payload sent over every open channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fullmesh_common::Result;
use rand::Rng;
use tokio::time::{self, Instant};
use tracing::{info, warn};

const MESSAGE_LEN: usize = 15;
const INITIAL_MESSAGE: &str = "START";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A text-capable channel the heartbeat writes to.
#[async_trait]
pub trait TextChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send_text(&self, text: String) -> Result<()>;
}

/// Counter-based message rotation.
///
/// The current message is repeated until it has been handed out once per
/// connected peer, then a new one is drawn.
#[derive(Debug, Clone)]
pub struct Rotation {
    message: String,
    sending_count: usize,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            message: INITIAL_MESSAGE.to_string(),
            sending_count: 0,
        }
    }
}

impl Rotation {
    pub fn next_with(&mut self, connections: usize, draw: impl FnOnce() -> String) -> String {
        self.sending_count += 1;
        if self.sending_count > connections {
            self.sending_count = 1;
            self.message = draw();
        }
        self.message.clone()
    }
}

/// Random string of ASCII letters.
pub fn random_letters(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Process-wide counters shared by every peer of a node.
#[derive(Debug, Default)]
pub struct MeshContext {
    connection_count: AtomicUsize,
    rotation: Mutex<Rotation>,
}

impl MeshContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new peer record and return the updated count.
    pub fn peer_added(&self) -> usize {
        self.connection_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn next_message(&self) -> String {
        let connections = self.connection_count();
        let mut rotation = self
            .rotation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rotation.next_with(connections, || random_letters(MESSAGE_LEN))
    }
}

/// Send the rotating message on `channel` every `interval` until a send
/// fails. The first message goes out one interval after the call.
///
/// Returns the number of messages sent.
pub async fn run_heartbeat(
    channel: Arc<dyn TextChannel>,
    context: Arc<MeshContext>,
    interval: Duration,
) -> usize {
    let label = channel.label();
    info!(
        "Data channel '{}' open. Random messages will now be sent every {:?}",
        label, interval
    );

    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    let mut sent = 0;
    loop {
        ticker.tick().await;
        let message = context.next_message();
        info!("Sending '{}'", message);
        if let Err(err) = channel.send_text(message).await {
            warn!("heartbeat on '{}' stopped: {}", label, err);
            return sent;
        }
        sent += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fullmesh_common::Error;

    #[test]
    fn test_rotation_repeats_until_every_peer_served() {
        let mut rotation = Rotation::default();
        let mut draws = vec!["Y".to_string(), "X".to_string()];
        let mut next = |r: &mut Rotation| r.next_with(2, || draws.pop().unwrap());

        let seq: Vec<String> = (0..6).map(|_| next(&mut rotation)).collect();
        assert_eq!(seq, vec!["START", "START", "X", "X", "Y", "Y"]);
    }

    #[test]
    fn test_rotation_single_peer_draws_every_time_after_start() {
        let mut rotation = Rotation::default();
        let mut counter = 0;
        let mut seq = Vec::new();
        for _ in 0..3 {
            seq.push(rotation.next_with(1, || {
                counter += 1;
                format!("m{counter}")
            }));
        }
        assert_eq!(seq, vec!["START", "m1", "m2"]);
    }

    #[test]
    fn test_random_letters_shape() {
        let s = random_letters(MESSAGE_LEN);
        assert_eq!(s.len(), MESSAGE_LEN);
        assert!(s.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn test_context_counts_peers() {
        let ctx = MeshContext::new();
        assert_eq!(ctx.connection_count(), 0);
        assert_eq!(ctx.peer_added(), 1);
        assert_eq!(ctx.peer_added(), 2);
        assert_eq!(ctx.next_message(), "START");
        assert_eq!(ctx.next_message(), "START");
        assert_ne!(ctx.next_message(), "START");
    }

    struct FlakyChannel {
        sent: Mutex<Vec<String>>,
        fail_after: usize,
    }

    #[async_trait]
    impl TextChannel for FlakyChannel {
        fn label(&self) -> String {
            "data".to_string()
        }

        async fn send_text(&self, text: String) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if sent.len() >= self.fail_after {
                return Err(Error::transport("data channel closed"));
            }
            sent.push(text);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_until_channel_closes() {
        let channel = Arc::new(FlakyChannel {
            sent: Mutex::new(Vec::new()),
            fail_after: 3,
        });
        let ctx = Arc::new(MeshContext::new());
        ctx.peer_added();

        let started = Instant::now();
        let sent = run_heartbeat(channel.clone(), ctx, Duration::from_secs(5)).await;

        assert_eq!(sent, 3);
        // Fourth tick is the failing one.
        assert!(started.elapsed() >= Duration::from_secs(20));
        let messages = channel.sent.lock().unwrap();
        assert_eq!(messages[0], "START");
        assert_eq!(messages.len(), 3);
    }
}
