use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};

use super::{sample_channel, ChannelSource, SampleSender};
use crate::{AudioConfig, Result, VisualError};

/// Chunks buffered between the device callback and the capture thread.
const CHANNEL_CAPACITY: usize = 64;

/// Opens an input stream and returns it together with the sample source it
/// feeds. The stream must stay on the thread that created it.
pub(super) fn open_input(config: &AudioConfig) -> Result<(cpal::Stream, ChannelSource, u32)> {
    let host = cpal::default_host();
    let device = match config.device.as_deref() {
        Some(name) => host
            .input_devices()
            .map_err(|err| VisualError::AudioDeviceUnavailable(err.to_string()))?
            .find(|device| device.name().is_ok_and(|candidate| candidate == name))
            .ok_or_else(|| {
                VisualError::AudioDeviceUnavailable(format!("no input device named `{name}`"))
            })?,
        None => host.default_input_device().ok_or_else(|| {
            VisualError::AudioDeviceUnavailable("no default input device".to_string())
        })?,
    };

    let supported = device
        .default_input_config()
        .map_err(|err| VisualError::AudioDeviceUnavailable(err.to_string()))?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();
    let sample_rate = stream_config.sample_rate.0;

    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        channels = stream_config.channels,
        "opening audio input"
    );

    let (tx, source) = sample_channel(CHANNEL_CAPACITY);
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, tx),
        other => Err(VisualError::AudioDeviceUnavailable(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|err| VisualError::AudioDeviceUnavailable(err.to_string()))?;

    Ok((stream, source, sample_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: SampleSender,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Down-mix interleaved frames to mono.
                let mono = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
                    })
                    .collect();
                tx.push(mono);
            },
            |err| tracing::warn!(error = %err, "audio stream error"),
            None,
        )
        .map_err(|err| VisualError::AudioDeviceUnavailable(err.to_string()))
}
