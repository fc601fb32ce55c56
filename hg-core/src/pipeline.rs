//! The checkpoint decision pipeline
//!
//! One completed reader frame goes through, in order:
//!
//! 1. frame validation (length and parity)
//! 2. reader-level gates (anti-bounce, raw value, credential)
//! 3. authorization lookup
//! 4. helmet fusion, for authorized cards only
//! 5. outcome gate
//! 6. durable append and manifest recomputation
//! 7. a rate-limited upload attempt
//!
//! Nothing in here returns an error to the poll loop: every failure is logged
//! and folded into the returned [`Decision`].

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use hg_protocol::PeriodManifest;

use crate::access::{reload_or_keep, AuthorizationStore, DedupGates, Gate, OutcomeKey};
use crate::clock::{elapsed_ms, Clock};
use crate::config::{DeviceConfig, ProofImagePolicy};
use crate::constants::timing::CARDS_FILE_CHECK_MS;
use crate::engine::{FrameClassifier, FusionEngine, FusionResult};
use crate::error::{HelmgateError, Result};
use crate::journal::{AccessEvent, EventJournal};
use crate::reader::{Credential, RawFrame};
use crate::sync::{CardSyncer, SyncOutcome, Transport, UploadOutcome, UploadScheduler};

/// What the pipeline did with one frame
#[derive(Debug)]
pub enum Decision {
    /// Wrong bit count or parity; discarded
    Rejected(HelmgateError),
    /// Dropped by a reader-level gate before any lookup
    Suppressed { raw: u32, gate: Gate },
    /// A new event was appended
    Logged {
        event: AccessEvent,
        fusion: Option<FusionResult>,
        manifest: Option<PeriodManifest>,
        upload: UploadOutcome,
    },
    /// Same outcome as a recent event; not logged again. Authorized
    /// outcomes still get an upload attempt.
    Deduplicated { outcome: OutcomeKey, upload: Option<UploadOutcome> },
    /// The event could not be written
    Unrecorded { event: AccessEvent, error: HelmgateError },
}

pub struct Checkpoint {
    clock: Arc<dyn Clock>,
    cards: Arc<AuthorizationStore>,
    gates: DedupGates,
    journal: EventJournal,
    fusion: FusionEngine,
    uploads: UploadScheduler,
    card_sync: CardSyncer,
    proof_images: ProofImagePolicy,
    cards_poll_ms: u64,
    last_pull_ms: Option<u64>,
    last_file_check_ms: u64,
}

impl Checkpoint {
    /// Prepare storage and load the authorization table
    pub fn new(config: &DeviceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.ensure_dirs()?;
        let cards = Arc::new(AuthorizationStore::open(config.cards_csv())?);
        let journal = EventJournal::new(config);
        journal.ensure_period_file(&journal.period_for(&clock.local_now()))?;

        Ok(Self {
            clock,
            cards,
            gates: DedupGates::new(&config.timing),
            journal,
            fusion: FusionEngine::new(&config.fusion),
            uploads: UploadScheduler::new(config),
            card_sync: CardSyncer::new(config),
            proof_images: config.proof_images,
            cards_poll_ms: config.timing.cards_poll_ms,
            last_pull_ms: None,
            last_file_check_ms: 0,
        })
    }

    pub fn cards(&self) -> &Arc<AuthorizationStore> {
        &self.cards
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    /// Run one completed frame through the whole pipeline
    pub fn handle_frame(
        &mut self,
        frame: &RawFrame,
        classifier: &mut dyn FrameClassifier,
        transport: &dyn Transport,
    ) -> Decision {
        let credential = match Credential::from_frame(frame) {
            Ok(c) => c,
            Err(e) => {
                warn!(bits = frame.bit_count, raw = format_args!("{:b}", frame.value), "Invalid frame: {}", e);
                return Decision::Rejected(e);
            }
        };
        let (raw, card) = (credential.raw, credential.key);

        let now_ms = self.clock.now_ms();
        if let Err(gate) = self.gates.admit_read(raw, card, now_ms) {
            debug!(raw, site = card.site, user = card.user, %gate, "Read suppressed");
            return Decision::Suppressed { raw, gate };
        }
        info!(raw, site = card.site, user = card.user, "Card read");

        let Some(name) = self.cards.lookup(card) else {
            info!(site = card.site, user = card.user, "Access denied: card not authorized");
            let outcome = OutcomeKey::denied(card);
            if self.gates.outcome_is_duplicate(&outcome, now_ms) {
                return Decision::Deduplicated { outcome, upload: None };
            }
            let event = AccessEvent::denied(self.clock.local_now(), raw, card);
            return self.record(event, None, outcome, now_ms, transport);
        };

        info!(site = card.site, user = card.user, holder = %name, "Card authorized, checking helmet");
        let fusion = self.fusion.run(classifier);
        let outcome = OutcomeKey::authorized(card, fusion.helmet);

        if self.gates.outcome_is_duplicate(&outcome, now_ms) {
            debug!(site = card.site, user = card.user, "Outcome already recorded");
            let period = self.current_period();
            let upload = self.attempt_upload(&period, false, transport);
            return Decision::Deduplicated { outcome, upload: Some(upload) };
        }

        if fusion.helmet {
            info!(score = format_args!("{:.2}", fusion.confidence), "Access granted: helmet present");
        } else {
            info!(score = format_args!("{:.2}", fusion.confidence), "Access denied: no helmet");
        }

        let image = fusion
            .image
            .clone()
            .filter(|_| self.proof_images.keeps(fusion.helmet))
            .unwrap_or_default();
        let event = AccessEvent {
            timestamp: self.clock.local_now(),
            raw,
            card,
            name,
            authorized: true,
            helmet: fusion.helmet,
            score: fusion.confidence,
            image,
        };
        self.record(event, Some(fusion), outcome, now_ms, transport)
    }

    fn record(
        &mut self,
        event: AccessEvent,
        fusion: Option<FusionResult>,
        outcome: OutcomeKey,
        now_ms: u64,
        transport: &dyn Transport,
    ) -> Decision {
        let period = match self.journal.append(&event) {
            Ok(period) => period,
            Err(error) => {
                error!(error = %error, "Could not append event");
                return Decision::Unrecorded { event, error };
            }
        };
        self.gates.record_outcome(outcome, now_ms);

        let manifest = match self.journal.recompute_manifest(&period, &self.clock.local_now()) {
            Ok(m) => Some(m),
            Err(e) => {
                error!(period = %period, error = %e, "Could not update manifest");
                None
            }
        };
        let upload = self.attempt_upload(&period, manifest.is_some(), transport);
        debug!(
            period = %period,
            uploaded = upload.attempted(),
            verified = upload.is_verified(),
            "Event recorded"
        );
        Decision::Logged { event, fusion, manifest, upload }
    }

    fn current_period(&self) -> String {
        self.journal.period_for(&self.clock.local_now())
    }

    /// Upload `period` if the cooldown allows, refreshing its manifest first
    /// unless the caller just did
    fn attempt_upload(&mut self, period: &str, manifest_fresh: bool, transport: &dyn Transport) -> UploadOutcome {
        if !self.uploads.begin_attempt(self.clock.now_ms()) {
            return UploadOutcome::CoolingDown;
        }
        if !manifest_fresh {
            if let Err(e) = self.journal.recompute_manifest(period, &self.clock.local_now()) {
                warn!(period, error = %e, "Manifest refresh before upload failed");
            }
        }
        self.uploads.upload(&self.journal, period, transport)
    }

    /// Force an upload of `period`, ignoring the cooldown
    pub fn upload_now(&mut self, period: &str, transport: &dyn Transport) -> UploadOutcome {
        if let Err(e) = self.journal.recompute_manifest(period, &self.clock.local_now()) {
            warn!(period, error = %e, "Manifest refresh before upload failed");
        }
        self.uploads.upload(&self.journal, period, transport)
    }

    /// Pull the authorization table now and reload it if it changed
    pub fn pull_cards(&mut self, transport: &dyn Transport) -> Result<SyncOutcome> {
        self.last_pull_ms = Some(self.clock.now_ms());
        let cards = Arc::clone(&self.cards);
        self.card_sync.ensure_updated(transport, || reload_or_keep(&cards))
    }

    /// Periodic housekeeping from the poll loop: picks up outside edits of
    /// the authorization file, then runs the card pull when due.
    ///
    /// Returns `None` when no pull was attempted.
    pub fn tick(&mut self, transport: &dyn Transport) -> Option<Result<SyncOutcome>> {
        let now = self.clock.now_ms();
        if elapsed_ms(now, self.last_file_check_ms) >= CARDS_FILE_CHECK_MS {
            self.last_file_check_ms = now;
            if let Err(e) = self.cards.reload_if_changed() {
                warn!(error = %e, "Could not re-read authorization table");
            }
        }

        if !self.card_sync.is_configured() {
            return None;
        }
        if let Some(last) = self.last_pull_ms {
            if elapsed_ms(now, last) < self.cards_poll_ms {
                return None;
            }
        }
        let result = self.pull_cards(transport);
        match &result {
            Ok(outcome) if outcome.updated => info!(version = %outcome.version, "Card list updated"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Card list pull failed"),
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::MockFrameClassifier;
    use crate::reader::CardKey;
    use crate::sync::{HttpResponse, MockTransport};
    use chrono::NaiveDate;
    use hg_protocol::{ClassifierFrame, Detection};
    use std::fs;
    use tempfile::TempDir;

    const CARD: CardKey = CardKey::new(148, 19_828);

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        checkpoint: Checkpoint,
    }

    fn fixture(tweak: impl FnOnce(&mut DeviceConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = DeviceConfig {
            data_dir: dir.path().join("data"),
            media_dir: dir.path().join("media"),
            state_dir: dir.path().join("config"),
            ..DeviceConfig::default()
        };
        config.server.function_url = Some("https://edge.example/upload".into());
        config.server.edge_api_key = Some("k".into());
        tweak(&mut config);

        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(config.cards_csv(), "site_code,user_code,nombre,enabled\n148,19828,Ana,1\n").unwrap();

        let start = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap().and_hms_opt(7, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(100_000, start));
        let checkpoint = Checkpoint::new(&config, clock.clone()).unwrap();
        Fixture { _dir: dir, clock, checkpoint }
    }

    fn frame_for(card: CardKey) -> RawFrame {
        RawFrame { bit_count: 26, value: Credential::encode(card), first_bit_ms: 0, last_bit_ms: 0 }
    }

    fn classifier(label: &'static str) -> MockFrameClassifier {
        let mut mock = MockFrameClassifier::new();
        mock.expect_classify_frame().returning(move || {
            Ok(ClassifierFrame {
                detections: vec![Detection { label: label.into(), x: 0, y: 0, w: 5, h: 5, score: 0.8 }],
                image: Some("/media/proof.jpg".into()),
            })
        });
        mock
    }

    fn accepting_transport(times: usize) -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect_post_upload().times(times).returning(|_, _| {
            Ok(HttpResponse { status: 200, body: br#"{"ok":true,"verified":true}"#.to_vec() })
        });
        mock
    }

    #[test]
    fn test_invalid_frame_rejected() {
        let mut f = fixture(|_| {});
        let mut bad = frame_for(CARD);
        bad.value ^= 1;
        let d = f.checkpoint.handle_frame(&bad, &mut MockFrameClassifier::new(), &MockTransport::new());
        assert!(matches!(d, Decision::Rejected(HelmgateError::Parity { .. })));
    }

    #[test]
    fn test_authorized_with_helmet_logged_and_uploaded() {
        let mut f = fixture(|_| {});
        let d = f.checkpoint.handle_frame(&frame_for(CARD), &mut classifier("casco"), &accepting_transport(1));
        match d {
            Decision::Logged { event, manifest, upload, .. } => {
                assert!(event.authorized && event.helmet);
                assert_eq!(event.name, "Ana");
                assert_eq!(event.image, "/media/proof.jpg");
                assert_eq!(manifest.unwrap().count, 1);
                assert!(upload.is_verified());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_card_logged_as_denied() {
        let mut f = fixture(|_| {});
        let stranger = CardKey::new(1, 2);
        let mut no_classifier = MockFrameClassifier::new();
        no_classifier.expect_classify_frame().never();

        let d = f.checkpoint.handle_frame(&frame_for(stranger), &mut no_classifier, &accepting_transport(1));
        match d {
            Decision::Logged { event, fusion, .. } => {
                assert!(!event.authorized && !event.helmet);
                assert_eq!(event.name, "");
                assert!(fusion.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_repeat_inside_cooldown_is_suppressed() {
        let mut f = fixture(|_| {});
        let t = accepting_transport(1);
        f.checkpoint.handle_frame(&frame_for(CARD), &mut classifier("nocasco"), &t);
        f.clock.advance_ms(2_000);
        let d = f.checkpoint.handle_frame(&frame_for(CARD), &mut classifier("nocasco"), &t);
        assert!(matches!(d, Decision::Suppressed { gate: Gate::RawValue, .. }));
    }

    #[test]
    fn test_second_event_inside_upload_cooldown_not_sent() {
        let mut f = fixture(|_| {});
        let t = accepting_transport(1);
        f.checkpoint.handle_frame(&frame_for(CARD), &mut classifier("casco"), &t);
        f.clock.advance_ms(1_000);

        let d = f.checkpoint.handle_frame(&frame_for(CardKey::new(1, 2)), &mut MockFrameClassifier::new(), &t);
        match d {
            Decision::Logged { manifest, upload, .. } => {
                assert_eq!(manifest.unwrap().count, 2);
                assert!(matches!(upload, UploadOutcome::CoolingDown));
                assert!(!upload.attempted());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outcome_dedup_triggers_upload_only() {
        let mut f = fixture(|c| {
            c.timing.card_cooldown_ms = 1_000;
            c.timing.anti_bounce_ms = 100;
            c.timing.upload_cooldown_ms = 1_000;
        });
        let t = accepting_transport(2);

        f.checkpoint.handle_frame(&frame_for(CARD), &mut classifier("nocasco"), &t);
        f.clock.advance_ms(2_000);
        let d = f.checkpoint.handle_frame(&frame_for(CARD), &mut classifier("nocasco"), &t);
        match d {
            Decision::Deduplicated { outcome, upload } => {
                assert_eq!(outcome, OutcomeKey::authorized(CARD, false));
                assert!(upload.is_some_and(|u| u.is_verified()));
            }
            other => panic!("unexpected {:?}", other),
        }
        let events = f.checkpoint.journal().query("202508", &Default::default()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_tick_pulls_on_schedule() {
        let mut f = fixture(|c| c.server.cards_url = Some("https://edge.example/cards".into()));
        let mut t = MockTransport::new();
        t.expect_get()
            .times(2)
            .returning(|_, _| Ok(HttpResponse { status: 503, body: Vec::new() }));

        assert!(matches!(f.checkpoint.tick(&t), Some(Err(_))));
        f.clock.advance_ms(60_000);
        assert!(f.checkpoint.tick(&t).is_none());
        f.clock.advance_ms(600_000);
        assert!(f.checkpoint.tick(&t).is_some());
    }

    #[test]
    fn test_tick_idle_without_cards_url() {
        let mut f = fixture(|_| {});
        assert!(f.checkpoint.tick(&MockTransport::new()).is_none());
    }

    #[test]
    fn test_tick_picks_up_outside_edits() {
        let mut f = fixture(|_| {});
        let stranger = CardKey::new(9, 9);
        assert!(!f.checkpoint.cards().is_authorized(stranger));

        let path = f.checkpoint.cards().path().to_path_buf();
        fs::write(&path, "site_code,user_code,nombre,enabled\n148,19828,Ana,1\n9,9,Eva,1\n").unwrap();
        f.clock.advance_ms(CARDS_FILE_CHECK_MS);
        f.checkpoint.tick(&MockTransport::new());
        assert!(f.checkpoint.cards().is_authorized(stranger));
    }
}
