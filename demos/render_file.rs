use anyhow::{bail, Context, Error};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use spatconv::convolver::ConvolverBuilder;
use spatconv::filter::{DirectionalFilterSet, ImpulseResponses};
use spatconv::state::RunState;
use spatconv::tracker::{DataIndex, SharedOrientation};
use spatconv::RenderClient;

use std::env;
use std::sync::Arc;

// Head rotation in degrees applied every block
const ROTATION: f32 = 0.5;
// Single block size in frames
const BLOCK_LEN: usize = 512;
// Length of the synthetic HRIRs
const HRIR_LEN: usize = 256;
const HEAD_RADIUS: f32 = 0.0875;
const SPEED_OF_SOUND: f32 = 343.0;

/// Crude spherical head model: interaural time and level difference only
fn synthetic_hrirs(sample_rate: f32) -> (Vec<(f32, f32)>, Vec<ImpulseResponses>) {
    let directions = (0..72).map(|i| (i as f32 * 5.0, 0.0)).collect::<Vec<_>>();

    let irs = directions
        .iter()
        .map(|(azimuth, _)| {
            let lateral = azimuth.to_radians().sin();
            let itd = HEAD_RADIUS / SPEED_OF_SOUND * (lateral.asin() + lateral) * sample_rate;

            let mut irs = ImpulseResponses::new(1, 2, HRIR_LEN);

            // positive azimuth is left
            let (near, far) = if lateral >= 0.0 { (0, 1) } else { (1, 0) };
            irs.channel_mut(0, near)[0] = 1.0;
            irs.channel_mut(0, far)[itd.abs().round() as usize] = 1.0 - 0.5 * lateral.abs();

            irs
        })
        .collect();

    (directions, irs)
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() != 3 {
        bail!("Usage: {} MONO_WAV_FILE OUTPUT_WAV_FILE", args[0].clone());
    }

    let mut reader = WavReader::open(&args[1]).context("Open wav file failed")?;
    let spec = reader.spec();

    if spec.sample_format != SampleFormat::Float || spec.channels != 1 {
        bail!("Unsupported format, must be F32, mono channel");
    }

    println!("Wave file spec: {:?}", spec);

    let sample_rate = spec.sample_rate as f32;
    let (directions, irs) = synthetic_hrirs(sample_rate);
    let filter = DirectionalFilterSet::new(sample_rate, directions, irs, true)?;

    let tracker = Arc::new(SharedOrientation::default());
    let run_state = Arc::new(RunState::default());

    let convolver = ConvolverBuilder::new(BLOCK_LEN)
        .with_tracker(Arc::clone(&tracker))
        .with_run_state(Arc::clone(&run_state))
        .build_adjustable_fd(filter)?;

    let mut client = RenderClient::new(Box::new(convolver), sample_rate, run_state)?;

    let mut writer = WavWriter::create(
        &args[2],
        WavSpec {
            channels: 2,
            ..spec
        },
    )
    .context("Create output file failed")?;

    let samples = reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?;
    let mut input = vec![0.0; BLOCK_LEN];
    let mut azimuth = 0.0;

    for block in samples.chunks(BLOCK_LEN) {
        input.fill(0.0);
        input[..block.len()].copy_from_slice(block);

        tracker.set(DataIndex::Azimuth, azimuth);
        azimuth = (azimuth + ROTATION) % 360.0;

        let output = client.process(&input)?;
        let (left, right) = output.split_at(BLOCK_LEN);

        for (l, r) in Iterator::zip(left.iter(), right.iter()) {
            writer.write_sample(*l)?;
            writer.write_sample(*r)?;
        }
    }

    writer.finalize()?;

    Ok(())
}
