/// Three-channel mixer: Deck A, Deck B, Voice → stereo master bus.
///
/// Per-deck gain is applied by the deck itself; the mixer sums and applies
/// the master volume. All buffers are interleaved stereo f32 (L R L R …).
pub struct Mixer {
    pub master_gain: f32,
}

impl Default for Mixer {
    fn default() -> Self {
        Self { master_gain: 1.0 }
    }
}

impl Mixer {
    pub fn new(master_gain: f32) -> Self {
        Self { master_gain }
    }

    /// Sum the three channel buffers into `master_buf`, hard-clipped to ±1.
    ///
    /// Called on the real-time audio thread: no allocations.
    pub fn mix_into(&self, master_buf: &mut [f32], deck_a: &[f32], deck_b: &[f32], voice: &[f32]) {
        debug_assert_eq!(master_buf.len(), deck_a.len());
        debug_assert_eq!(master_buf.len(), deck_b.len());
        debug_assert_eq!(master_buf.len(), voice.len());

        for (i, out) in master_buf.iter_mut().enumerate() {
            *out = ((deck_a[i] + deck_b[i] + voice[i]) * self.master_gain).clamp(-1.0, 1.0);
        }
    }
}
