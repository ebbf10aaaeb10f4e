use super::frame_rms;
use crate::audio::{FRAME_MS, ms_to_samples};
use crate::config::VadConfig;
use std::collections::VecDeque;

/// Output of [`UtteranceDetector::process_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Energy rose above the speech threshold.
    SpeechStarted,
    /// Trailing silence closed an utterance long enough to transcribe.
    Utterance(Vec<i16>),
}

/// Energy endpointer over 8 kHz frames.
pub struct UtteranceDetector {
    threshold: f32,
    silence_frames: u32,
    min_speech_samples: usize,
    pre_roll_frames: usize,
    pre_roll: VecDeque<Vec<i16>>,
    speech_buffer: Vec<i16>,
    in_speech: bool,
    silence_count: u32,
}

/// Audio kept from before speech onset so the first phoneme is not clipped.
const PRE_ROLL_MS: u32 = 200;

impl UtteranceDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.speech_threshold,
            silence_frames: (config.endpoint_silence_ms / FRAME_MS).max(1),
            min_speech_samples: ms_to_samples(config.endpoint_min_speech_ms),
            pre_roll_frames: (PRE_ROLL_MS / FRAME_MS) as usize,
            pre_roll: VecDeque::new(),
            speech_buffer: Vec::new(),
            in_speech: false,
            silence_count: 0,
        }
    }

    pub fn process_frame(&mut self, frame: &[i16]) -> Option<EndpointEvent> {
        let is_speech = frame_rms(frame) > self.threshold;

        if is_speech {
            self.silence_count = 0;
            if !self.in_speech {
                self.in_speech = true;
                self.speech_buffer.clear();
                for f in self.pre_roll.drain(..) {
                    self.speech_buffer.extend_from_slice(&f);
                }
                self.speech_buffer.extend_from_slice(frame);
                return Some(EndpointEvent::SpeechStarted);
            }
            self.speech_buffer.extend_from_slice(frame);
            return None;
        }

        if !self.in_speech {
            self.pre_roll.push_back(frame.to_vec());
            while self.pre_roll.len() > self.pre_roll_frames {
                self.pre_roll.pop_front();
            }
            return None;
        }

        self.silence_count += 1;
        self.speech_buffer.extend_from_slice(frame);
        if self.silence_count < self.silence_frames {
            return None;
        }

        self.in_speech = false;
        self.silence_count = 0;
        let audio = std::mem::take(&mut self.speech_buffer);
        if audio.len() >= self.min_speech_samples + self.trailing_silence_samples() {
            Some(EndpointEvent::Utterance(audio))
        } else {
            None
        }
    }

    /// Close any open utterance, e.g. when the stream finishes.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        let was_speaking = std::mem::take(&mut self.in_speech);
        self.silence_count = 0;
        self.pre_roll.clear();
        let audio = std::mem::take(&mut self.speech_buffer);
        (was_speaking && audio.len() >= self.min_speech_samples).then_some(audio)
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    fn trailing_silence_samples(&self) -> usize {
        ms_to_samples(self.silence_frames * FRAME_MS)
    }
}
