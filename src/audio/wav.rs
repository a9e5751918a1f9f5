//! In-memory WAV container wrapping for recorded PCM.

use std::io::Cursor;

use hound::{WavSpec, WavWriter};

use crate::capture::AudioFormat;

pub const WAV_MIME_TYPE: &str = "audio/wav";

/// Wrap interleaved 16-bit samples into a WAV file image.
/// A trailing partial frame (fewer samples than channels) is dropped.
pub fn encode_wav(samples: &[i16], format: AudioFormat) -> Result<Vec<u8>, hound::Error> {
    let channels = usize::from(format.channels.max(1));
    let samples = &samples[..samples.len() - samples.len() % channels];

    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16, // Always write as 16-bit
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    #[test]
    fn encoded_wav_reads_back() {
        let format = AudioFormat {
            sample_rate: 16_000,
            channels: 1,
        };
        let samples: Vec<i16> = vec![0, 100, -100, i16::MAX, i16::MIN];
        let bytes = encode_wav(&samples, format).unwrap();

        assert_eq!(&bytes[0..4], b"RIFF");
        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn partial_frame_is_dropped() {
        let format = AudioFormat {
            sample_rate: 8_000,
            channels: 2,
        };
        let bytes = encode_wav(&[1, 2, 3], format).unwrap();
        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 2);
    }

    #[test]
    fn empty_recording_is_still_a_valid_container() {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
        };
        let bytes = encode_wav(&[], format).unwrap();
        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 0);
    }
}
