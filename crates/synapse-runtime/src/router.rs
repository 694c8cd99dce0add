//! Intent Router — persists [`Intent`]s to the filesystem, prunes them, and
//! translates them into ChemBus [`Signal`]s.
//!
//! Every intent is written to its own file named by millisecond timestamp and
//! checksum so concurrent writers never collide and a reader can detect
//! tampering by recomputing [`Intent::compute_checksum`]. `curiosity_investigate`
//! intents expand into a `Q_CURIOSITY_INVESTIGATE` signal carrying the full
//! [`CuriosityQuestion`] shape in the signal's facts; every other intent type
//! becomes a generically-shaped signal named after the intent type, upper-cased.
//! A signal the bus could not deliver (no active subscribers) is recorded in
//! the dead-letter queue rather than dropped silently.

use std::path::{Path, PathBuf};

use chrono::Utc;
use synapse_bus::ChemBus;
use synapse_memory::DeadLetterQueue;
use synapse_types::{CuriosityQuestion, Intent, Signal, SynapseError};

/// How long a persisted intent file is kept before [`IntentRouter::prune`]
/// deletes it.
const INTENT_MAX_AGE: chrono::Duration = chrono::Duration::hours(24);

/// Persists intents to disk and republishes them onto the [`ChemBus`].
pub struct IntentRouter {
    intents_dir: PathBuf,
    bus: ChemBus,
    dead_letters: DeadLetterQueue,
}

impl IntentRouter {
    /// `intents_dir` is created if it does not already exist. Dead letters
    /// (signals with no active subscriber) are appended to
    /// `dead_letters_path`.
    pub fn new(
        intents_dir: impl Into<PathBuf>,
        bus: ChemBus,
        dead_letters_path: impl Into<PathBuf>,
    ) -> Result<Self, SynapseError> {
        let intents_dir = intents_dir.into();
        std::fs::create_dir_all(&intents_dir)?;
        Ok(Self { intents_dir, bus, dead_letters: DeadLetterQueue::new(dead_letters_path) })
    }

    /// Persist `intent` to its own file, stamping it with a checksum first.
    ///
    /// Returns the path written.
    pub async fn persist(&self, intent: &mut Intent) -> Result<PathBuf, SynapseError> {
        let checksum = intent.compute_checksum();
        intent.checksum = Some(checksum.clone());
        let filename = format!("{}-{}.json", Utc::now().timestamp_millis(), &checksum[..12.min(checksum.len())]);
        let path = self.intents_dir.join(filename);
        let body = serde_json::to_vec_pretty(intent)?;

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(path)
    }

    /// List every pending (not yet consumed) intent file, oldest first.
    pub fn pending(&self) -> Result<Vec<PathBuf>, SynapseError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.intents_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Read an intent file and verify its checksum matches the stored value.
    ///
    /// Returns `Ok(None)` if the file is missing the optional checksum field
    /// (nothing to verify against); `Ok(Some(true))` if the recomputed
    /// checksum matches, `Ok(Some(false))` if it does not.
    pub fn verify(path: &Path) -> Result<(Intent, Option<bool>), SynapseError> {
        let body = std::fs::read(path)?;
        let intent: Intent = serde_json::from_slice(&body)?;
        let ok = intent.checksum.as_deref().map(|stored| stored == intent.compute_checksum());
        Ok((intent, ok))
    }

    /// Mark an intent consumed by deleting its file.
    pub fn consume(path: &Path) -> Result<(), SynapseError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every persisted intent file older than 24 hours.
    ///
    /// Returns the number of files removed. A file whose name does not carry
    /// a parseable millisecond timestamp prefix is left alone.
    pub fn prune(&self) -> Result<usize, SynapseError> {
        let cutoff = Utc::now() - INTENT_MAX_AGE;
        let mut removed = 0;
        for path in self.pending()? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Some(millis_str) = stem.split('-').next() else { continue };
            let Ok(millis) = millis_str.parse::<i64>() else { continue };
            let Some(created) = chrono::DateTime::from_timestamp_millis(millis) else { continue };
            if created < cutoff {
                Self::consume(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Translate `intent` into a [`Signal`] and publish it on the bus.
    ///
    /// `curiosity_investigate` intents carry a [`CuriosityQuestion`] in
    /// `intent.data` under the key `"question"` and expand into a
    /// `Q_CURIOSITY_INVESTIGATE` signal whose facts mirror the question's
    /// fields. Every other intent type becomes a signal topic equal to the
    /// intent type upper-cased, with `intent.data` copied verbatim into
    /// `facts`. Undeliverable signals (no active subscribers) are appended
    /// to the dead-letter queue rather than propagated as an error.
    pub async fn route(&self, intent: &Intent) -> Result<(), SynapseError> {
        let signal = if intent.intent_type == "curiosity_investigate" {
            self.build_curiosity_signal(intent)?
        } else {
            self.build_generic_signal(intent)
        };
        let topic = signal.topic.clone();
        match self.bus.publish(signal) {
            Ok(_) => Ok(()),
            Err(SynapseError::Bus(reason)) => {
                self.dead_letters.record(&topic, &reason).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn build_generic_signal(&self, intent: &Intent) -> Signal {
        let mut signal = Signal::new(intent.intent_type.to_uppercase()).with_intensity(f64::from(intent.priority));
        for (key, value) in &intent.data {
            signal = signal.with_fact(key.clone(), value.clone());
        }
        signal
    }

    fn build_curiosity_signal(&self, intent: &Intent) -> Result<Signal, SynapseError> {
        let question = intent
            .data
            .get("question")
            .ok_or_else(|| SynapseError::InvalidEvent("curiosity_investigate intent missing 'question'".into()))?;
        let question: CuriosityQuestion = serde_json::from_value(question.clone())?;

        Ok(Signal::new("Q_CURIOSITY_INVESTIGATE")
            .with_fact("question_id", question.id.clone())
            .with_fact("hypothesis", question.hypothesis.clone())
            .with_fact("question", question.question.clone())
            .with_fact("priority", question.priority.clone())
            .with_fact("capability_key", question.capability_key.clone())
            .with_fact("evidence_hash", question.evidence_hash.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("synapse-router-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&p);
        p
    }

    #[tokio::test]
    async fn persist_writes_file_with_checksum() {
        let dir = tmp_dir("persist");
        let dl = dir.join("dead-letters.jsonl");
        let router = IntentRouter::new(&dir, ChemBus::default(), &dl).unwrap();

        let mut intent = Intent::new("curiosity_investigate", 5, "unindexed file found");
        let path = router.persist(&mut intent).await.unwrap();
        assert!(path.exists());
        assert!(intent.checksum.is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn pending_lists_only_json_files() {
        let dir = tmp_dir("pending");
        let dl = dir.join("dead-letters.jsonl");
        let router = IntentRouter::new(&dir, ChemBus::default(), &dl).unwrap();

        let mut a = Intent::new("hardware_alert", 9, "disk full");
        router.persist(&mut a).await.unwrap();
        std::fs::write(dir.join("notes.txt"), "not an intent").unwrap();

        let pending = router.pending().unwrap();
        assert_eq!(pending.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn verify_detects_tampered_checksum() {
        let dir = tmp_dir("verify");
        let dl = dir.join("dead-letters.jsonl");
        let router = IntentRouter::new(&dir, ChemBus::default(), &dl).unwrap();

        let mut intent = Intent::new("hardware_alert", 9, "disk full");
        let path = router.persist(&mut intent).await.unwrap();

        let (_, ok) = IntentRouter::verify(&path).unwrap();
        assert_eq!(ok, Some(true));

        let mut tampered: Intent = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        tampered.reason = "tampered".to_string();
        std::fs::write(&path, serde_json::to_vec(&tampered).unwrap()).unwrap();

        let (_, ok) = IntentRouter::verify(&path).unwrap();
        assert_eq!(ok, Some(false));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn consume_removes_file_and_is_idempotent() {
        let dir = tmp_dir("consume");
        let dl = dir.join("dead-letters.jsonl");
        let router = IntentRouter::new(&dir, ChemBus::default(), &dl).unwrap();

        let mut intent = Intent::new("hardware_alert", 9, "disk full");
        let path = router.persist(&mut intent).await.unwrap();
        IntentRouter::consume(&path).unwrap();
        assert!(!path.exists());
        IntentRouter::consume(&path).unwrap(); // idempotent
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn route_curiosity_investigate_builds_question_signal() {
        let dir = tmp_dir("route-curiosity");
        let dl = dir.join("dead-letters.jsonl");
        let bus = ChemBus::default();
        let mut sub = bus.subscribe_topic("Q_CURIOSITY_INVESTIGATE");
        let router = IntentRouter::new(&dir, bus, &dl).unwrap();

        let question = CuriosityQuestion::new(
            "discover.module.foo",
            "foo module is undocumented",
            "what does foo do?",
            vec!["file_path: foo.rs".to_string()],
            "medium",
            "docs.foo",
        );
        let intent = Intent::new("curiosity_investigate", 3, "scanner found undocumented module")
            .with_data("question", serde_json::to_value(&question).unwrap());

        router.route(&intent).await.unwrap();
        let signal = sub.recv().await.unwrap();
        assert_eq!(signal.fact_str("question_id"), Some("discover.module.foo"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn route_generic_intent_copies_data_into_facts() {
        let dir = tmp_dir("route-generic");
        let dl = dir.join("dead-letters.jsonl");
        let bus = ChemBus::default();
        let mut sub = bus.subscribe_topic("HARDWARE_ALERT");
        let router = IntentRouter::new(&dir, bus, &dl).unwrap();

        let intent = Intent::new("hardware_alert", 9, "disk full").with_data("device", "/dev/sda1");
        router.route(&intent).await.unwrap();
        let signal = sub.recv().await.unwrap();
        assert_eq!(signal.fact_str("device"), Some("/dev/sda1"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn route_with_no_subscribers_records_dead_letter() {
        let dir = tmp_dir("dead-letter");
        let dl = dir.join("dead-letters.jsonl");
        let router = IntentRouter::new(&dir, ChemBus::default(), &dl).unwrap();

        let intent = Intent::new("hardware_alert", 9, "disk full");
        router.route(&intent).await.unwrap();

        let dlq = DeadLetterQueue::new(&dl);
        assert_eq!(dlq.count(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn prune_removes_old_intent_files() {
        let dir = tmp_dir("prune");
        let dl = dir.join("dead-letters.jsonl");
        let router = IntentRouter::new(&dir, ChemBus::default(), &dl).unwrap();

        let old_millis = (Utc::now() - chrono::Duration::hours(25)).timestamp_millis();
        let old_path = dir.join(format!("{old_millis}-deadbeef0000.json"));
        std::fs::write(&old_path, b"{}").unwrap();

        let mut fresh = Intent::new("hardware_alert", 9, "disk full");
        router.persist(&mut fresh).await.unwrap();

        let removed = router.prune().unwrap();
        assert_eq!(removed, 1);
        assert!(!old_path.exists());
        assert_eq!(router.pending().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
