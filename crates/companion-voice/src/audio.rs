//! Response audio decoding.
//!
//! The synthesizer returns a base64 WAV payload. It is decoded once into mono
//! f32 PCM, which both the player and the lip-sync analyzer read from.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use companion_avatar::PcmAudio;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;

/// Decode a base64 WAV payload into mono PCM
pub fn decode_base64_wav(payload: &str) -> VoiceResult<PcmAudio> {
    let bytes = STANDARD.decode(payload.trim())?;
    decode_wav(&bytes)
}

/// Decode WAV bytes into mono PCM. Multi-channel audio is averaged down.
pub fn decode_wav(bytes: &[u8]) -> VoiceResult<PcmAudio> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(VoiceError::Decode("WAV has no channels".to_string()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = match spec.bits_per_sample {
                bits @ 1..=32 => (1i64 << (bits - 1)) as f32,
                bits => {
                    return Err(VoiceError::Decode(format!(
                        "unsupported bit depth {}",
                        bits
                    )))
                }
            };
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = spec.channels as usize;
    let mono: Vec<f32> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(PcmAudio::new(mono, spec.sample_rate))
}

/// Encode mono PCM as 16-bit WAV
pub fn encode_wav(audio: &PcmAudio) -> VoiceResult<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate(),
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &s in audio.samples() {
            writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

pub fn encode_base64_wav(audio: &PcmAudio) -> VoiceResult<String> {
    Ok(STANDARD.encode(encode_wav(audio)?))
}

/// Sine tone, used by the placeholder synthesizer
pub fn tone(frequency: f32, duration_secs: f32, sample_rate: u32, amplitude: f32) -> PcmAudio {
    let len = (duration_secs * sample_rate as f32).round() as usize;
    let samples: Vec<f32> = (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect();
    PcmAudio::new(samples, sample_rate)
}
