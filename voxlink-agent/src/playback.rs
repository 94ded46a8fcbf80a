//! Seam between the conversation session and whatever renders agent speech

use voxlink_audio::AudioPlayer;

/// Plays synthesized agent audio
pub trait PlaybackEngine: Send + Sync {
    /// Queue mono PCM16 recorded at `sample_rate`
    fn enqueue(&self, pcm: &[i16], sample_rate: u32) -> voxlink_audio::Result<()>;

    /// Audio is audibly playing right now
    fn is_playing(&self) -> bool;

    fn is_suspended(&self) -> bool;

    fn resume(&self);

    /// Drop everything queued
    fn stop(&self);
}

impl PlaybackEngine for AudioPlayer {
    fn enqueue(&self, pcm: &[i16], sample_rate: u32) -> voxlink_audio::Result<()> {
        AudioPlayer::enqueue(self, pcm, sample_rate)
    }

    fn is_playing(&self) -> bool {
        AudioPlayer::is_playing(self)
    }

    fn is_suspended(&self) -> bool {
        AudioPlayer::is_suspended(self)
    }

    fn resume(&self) {
        AudioPlayer::resume(self)
    }

    fn stop(&self) {
        AudioPlayer::stop(self)
    }
}
