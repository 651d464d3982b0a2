//! G.711 µ-law packetization for the outgoing audio track.
//!
//! Captured frames arrive as float PCM at the device rate. Each one is mixed
//! to mono, decimated to 8 kHz and companded to one byte per sample.

use std::time::Duration;

use crate::audio::AudioFrame;

pub const SAMPLE_RATE: u32 = 8000;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;
const SILENCE: u8 = 0xFF;

/// Compand one 16-bit sample.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Encode one captured frame. The output holds one byte per 8 kHz sample.
pub fn encode(frame: &AudioFrame) -> Vec<u8> {
    let channels = frame.channels.max(1) as usize;
    let mono: Vec<f32> = frame
        .samples
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect();

    let out_len = mono.len() * SAMPLE_RATE as usize / frame.sample_rate.max(1) as usize;
    if out_len == 0 {
        return Vec::new();
    }
    let step = mono.len() as f64 / out_len as f64;
    (0..out_len)
        .map(|i| {
            let start = (i as f64 * step) as usize;
            let end = (((i + 1) as f64 * step) as usize).clamp(start + 1, mono.len());
            let window = &mono[start..end];
            let mean = window.iter().sum::<f32>() / window.len() as f32;
            linear_to_ulaw(to_i16(mean))
        })
        .collect()
}

/// A payload of silence lasting `duration`.
pub fn silence(duration: Duration) -> Vec<u8> {
    let samples = SAMPLE_RATE as u128 * duration.as_millis() / 1000;
    vec![SILENCE; samples as usize]
}
