mod word;

pub use word::{
    CHANNELS, Channel, GAIN_MAX, MAX_TONE_INDEX, MAX_WORDS_PER_FRAME, PAYLOAD_MASK,
    SILENCE_FRAME_LEN, TONES_PER_CHANNEL, Word, pack_commit, pack_gain, pack_index, silence_frame,
};
