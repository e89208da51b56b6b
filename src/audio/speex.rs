//! Optional SpeexDSP preprocessing chain (denoise/AGC/VAD/dereverb) ahead
//! of the AAC encoder, mono only. Config-gated; when disabled the PCM
//! passes through untouched.
//!
//! `speexdsp-sys` exposes the same preprocess API the original firmware
//! links against directly (it vendors libspeexdsp itself); this wraps the
//! raw `*mut SpeexPreprocessState` in a thin RAII owner with `Drop` freeing
//! the native state.

use speexdsp_sys::{
    speex_preprocess_ctl, speex_preprocess_run, speex_preprocess_state_destroy,
    speex_preprocess_state_init, SPEEX_PREPROCESS_SET_AGC, SPEEX_PREPROCESS_SET_AGC_DECREMENT,
    SPEEX_PREPROCESS_SET_AGC_INCREMENT, SPEEX_PREPROCESS_SET_AGC_LEVEL,
    SPEEX_PREPROCESS_SET_AGC_MAX_GAIN, SPEEX_PREPROCESS_SET_DENOISE,
    SPEEX_PREPROCESS_SET_DEREVERB, SPEEX_PREPROCESS_SET_NOISE_SUPPRESS,
    SPEEX_PREPROCESS_SET_PROB_CONTINUE, SPEEX_PREPROCESS_SET_PROB_START, SPEEX_PREPROCESS_SET_VAD,
};

use crate::config::AudioConfig;

pub struct SpeexPreprocessor {
    state: *mut speexdsp_sys::SpeexPreprocessState,
    frame_size: usize,
}

// The native state is only ever touched from the audio-encode worker thread
// that owns this struct; it is not shared across threads.
unsafe impl Send for SpeexPreprocessor {}

impl SpeexPreprocessor {
    pub fn new(frame_size: usize, sample_rate: u32, cfg: &AudioConfig) -> Self {
        unsafe {
            let state = speex_preprocess_state_init(frame_size as i32, sample_rate as i32);

            let mut denoise = cfg.speex_denoise as i32;
            speex_preprocess_ctl(state, SPEEX_PREPROCESS_SET_DENOISE as i32, &mut denoise as *mut _ as *mut _);

            let mut noise_suppress = cfg.speex_noise_suppress_db;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_NOISE_SUPPRESS as i32,
                &mut noise_suppress as *mut _ as *mut _,
            );

            let mut agc = cfg.speex_agc as i32;
            speex_preprocess_ctl(state, SPEEX_PREPROCESS_SET_AGC as i32, &mut agc as *mut _ as *mut _);

            let mut agc_level = cfg.speex_agc_level as f32;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_AGC_LEVEL as i32,
                &mut agc_level as *mut _ as *mut _,
            );

            let mut agc_inc = cfg.speex_agc_increment;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_AGC_INCREMENT as i32,
                &mut agc_inc as *mut _ as *mut _,
            );

            let mut agc_dec = cfg.speex_agc_decrement;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_AGC_DECREMENT as i32,
                &mut agc_dec as *mut _ as *mut _,
            );

            let mut agc_max = cfg.speex_agc_max_gain_db;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_AGC_MAX_GAIN as i32,
                &mut agc_max as *mut _ as *mut _,
            );

            let mut vad = cfg.speex_vad as i32;
            speex_preprocess_ctl(state, SPEEX_PREPROCESS_SET_VAD as i32, &mut vad as *mut _ as *mut _);

            let mut prob_start = cfg.speex_vad_prob_start;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_PROB_START as i32,
                &mut prob_start as *mut _ as *mut _,
            );

            let mut prob_continue = cfg.speex_vad_prob_continue;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_PROB_CONTINUE as i32,
                &mut prob_continue as *mut _ as *mut _,
            );

            let mut dereverb = cfg.speex_dereverb as i32;
            speex_preprocess_ctl(
                state,
                SPEEX_PREPROCESS_SET_DEREVERB as i32,
                &mut dereverb as *mut _ as *mut _,
            );

            SpeexPreprocessor { state, frame_size }
        }
    }

    /// Runs the preprocessing chain over exactly `frame_size` samples in
    /// place. Returns whether VAD judged the frame to contain voice (only
    /// meaningful when `speex_vad` is enabled).
    pub fn process(&mut self, pcm: &mut [i16]) -> bool {
        assert_eq!(pcm.len(), self.frame_size, "speex frame size mismatch");
        unsafe { speex_preprocess_run(self.state, pcm.as_mut_ptr()) != 0 }
    }
}

impl Drop for SpeexPreprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_chain_is_a_pass_through_by_config() {
        let cfg = AudioConfig { speex_enable: false, ..AudioConfig::default() };
        assert!(!cfg.speex_enable);
    }
}
