//! Multi-frame helmet classification
//!
//! The external classifier looks at one camera frame at a time. A single frame
//! is noisy (motion blur, a hand in front of the face), so the engine samples
//! up to `max_frames` of them and fuses the per-class tallies into one
//! decision.
//!
//! # Decision table
//!
//! | helmet hits vs no-helmet hits | outcome                                   |
//! |-------------------------------|-------------------------------------------|
//! | both zero                     | absent, confidence 0.0                    |
//! | counts differ                 | larger count wins, with its best score    |
//! | counts equal, bests differ    | higher best score wins                    |
//! | counts and bests equal        | [`TiePolicy`], reported with that score   |

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hg_protocol::{ClassifierFrame, LABEL_HELMET, LABEL_NO_HELMET};

use crate::config::FusionConfig;
use crate::constants::fusion::EARLY_STOP_MIN_HITS;
use crate::error::Result;

/// Resolution of an exact tie in both hit count and best score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Report the helmet as absent
    #[default]
    Deny,
    /// Report the helmet as present
    PreferHelmet,
}

/// One captured frame through the external classifier
#[cfg_attr(test, mockall::automock)]
pub trait FrameClassifier {
    fn classify_frame(&mut self) -> Result<ClassifierFrame>;
}

/// Hits and best score of one class
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassTally {
    pub hits: u32,
    pub best: f32,
}

impl ClassTally {
    fn record(&mut self, score: f32) -> bool {
        self.hits += 1;
        if score > self.best {
            self.best = score;
            return true;
        }
        false
    }
}

/// Fused outcome of one credential's sampling run
#[derive(Debug, Clone, PartialEq)]
pub struct FusionResult {
    pub helmet: bool,
    pub confidence: f32,
    pub frames: u32,
    pub helmet_tally: ClassTally,
    pub no_helmet_tally: ClassTally,
    /// Proof image of the frame that produced the winning score
    pub image: Option<String>,
}

/// Pure decision over the two tallies
pub fn decide(helmet: ClassTally, no_helmet: ClassTally, tie: TiePolicy) -> (bool, f32) {
    if helmet.hits == 0 && no_helmet.hits == 0 {
        return (false, 0.0);
    }
    if helmet.hits != no_helmet.hits {
        return if helmet.hits > no_helmet.hits {
            (true, helmet.best)
        } else {
            (false, no_helmet.best)
        };
    }
    if helmet.best > no_helmet.best {
        (true, helmet.best)
    } else if no_helmet.best > helmet.best {
        (false, no_helmet.best)
    } else {
        (tie == TiePolicy::PreferHelmet, helmet.best.max(no_helmet.best))
    }
}

pub struct FusionEngine {
    min_confidence: f32,
    max_frames: u32,
    early_stop: bool,
    tie_policy: TiePolicy,
}

impl FusionEngine {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            max_frames: config.max_frames.max(1),
            early_stop: config.early_stop,
            tie_policy: config.tie_policy,
        }
    }

    fn leads(&self, leader: &ClassTally, other: &ClassTally) -> bool {
        leader.hits >= EARLY_STOP_MIN_HITS
            && leader.hits > other.hits
            && leader.best >= self.min_confidence
    }

    /// Sample the classifier and fuse the results.
    ///
    /// A frame the classifier fails on counts as a frame without detections,
    /// so a broken camera degrades to the fail-safe outcome.
    pub fn run(&self, classifier: &mut dyn FrameClassifier) -> FusionResult {
        let mut helmet = ClassTally::default();
        let mut no_helmet = ClassTally::default();
        let mut helmet_image = None;
        let mut no_helmet_image = None;
        let mut last_image = None;
        let mut frames = 0;

        while frames < self.max_frames {
            frames += 1;
            let frame = match classifier.classify_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(frame = frames, error = %e, "Classifier frame failed");
                    continue;
                }
            };

            for det in &frame.detections {
                if det.score < self.min_confidence {
                    continue;
                }
                let (tally, image) = match det.label.as_str() {
                    LABEL_HELMET => (&mut helmet, &mut helmet_image),
                    LABEL_NO_HELMET => (&mut no_helmet, &mut no_helmet_image),
                    _ => continue,
                };
                if tally.record(det.score) {
                    *image = frame.image.clone();
                }
            }
            if frame.image.is_some() {
                last_image = frame.image;
            }

            if self.early_stop && (self.leads(&helmet, &no_helmet) || self.leads(&no_helmet, &helmet)) {
                debug!(frame = frames, "Fusion stopped early");
                break;
            }
        }

        let (present, confidence) = decide(helmet, no_helmet, self.tie_policy);
        let image = if helmet.hits == 0 && no_helmet.hits == 0 {
            last_image
        } else if present {
            helmet_image.or(last_image)
        } else {
            no_helmet_image.or(last_image)
        };

        debug!(
            helmet = present,
            confidence,
            frames,
            casco = helmet.hits,
            nocasco = no_helmet.hits,
            "Fusion result"
        );

        FusionResult {
            helmet: present,
            confidence,
            frames,
            helmet_tally: helmet,
            no_helmet_tally: no_helmet,
            image,
        }
    }
}
