use std::env;
use std::path;
use std::process;
use std::time;

use emdata::document::Document;
use emdata::{IngestBuilder, IngestError};

fn describe(doc: &Document) {
    match doc {
        Document::Start(start) => {
            println!("start {} sample={}", start.uid, start.sample_name);
            for (key, value) in start.metadata.iter().take(20) {
                println!("  {key}: {value}");
            }
            if start.metadata.len() > 20 {
                println!("  ... {} more keys", start.metadata.len() - 20);
            }
        }
        Document::Descriptor(descriptor) => {
            println!(
                "descriptor {} stream={} shape={:?} configuration keys={}",
                descriptor.uid,
                descriptor.name,
                descriptor.raw_shape().unwrap_or_default(),
                descriptor.configuration.len()
            );
        }
        Document::Event(event) => {
            if let Some(frames) = event.raw() {
                println!(
                    "event {} seq_num={} {:?} {}",
                    event.uid,
                    event.seq_num,
                    frames.shape(),
                    frames.dtype()
                );
            }
        }
        Document::Stop(stop) => {
            println!("stop {} {} {:?}", stop.uid, stop.exit_status, stop.num_events);
        }
    }
}

fn main() -> Result<(), IngestError> {
    env_logger::init();
    let path = path::PathBuf::from(env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Please provide a path to an electron microscopy data file");
        process::exit(1)
    }));
    let force = env::args().any(|a| a == "--force");

    let start = time::Instant::now();
    let run = IngestBuilder::new().open(&path)?;
    eprintln!("Format: {}, opened in {:?}", run.format(), start.elapsed());

    if force {
        for dataset in run.datasets() {
            let start = time::Instant::now();
            for frame in dataset.frames.frames() {
                frame.compute()?;
            }
            eprintln!(
                "Read {} frames of {} in {:?}",
                dataset.frame_count(),
                dataset.name,
                start.elapsed()
            );
        }
    }

    for (_, doc) in run.into_documents() {
        describe(&doc);
    }
    Ok(())
}
