//! Sensor feed plumbing: a bounded sample channel and CSV replay

use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{Sample, SampleKind};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Single-producer sample queue between the sensor driver and a session
pub fn sensor_channel(capacity: usize) -> (mpsc::Sender<Sample>, mpsc::Receiver<Sample>) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Deserialize)]
struct SampleRow {
    kind: String,
    value: f64,
    timestamp: f64,
}

/// Parse `kind,value,timestamp` rows with a header line
pub fn read_samples<R: Read>(reader: R) -> Result<Vec<Sample>> {
    let mut csv = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut samples = Vec::new();
    for (index, row) in csv.deserialize::<SampleRow>().enumerate() {
        let line = index + 2;
        let row = row.with_context(|| format!("Malformed sample on line {}", line))?;
        let kind: SampleKind = row
            .kind
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("Bad sample kind on line {}", line))?;
        samples.push(Sample::new(kind, row.value, row.timestamp));
    }
    Ok(samples)
}

pub fn read_samples_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open sample file: {}", path.display()))?;
    let samples = read_samples(file)
        .with_context(|| format!("Failed to read samples from {}", path.display()))?;
    debug!(count = samples.len(), path = %path.display(), "samples loaded");
    Ok(samples)
}

/// Push samples into the channel in order; returns how many were delivered
pub async fn replay(samples: Vec<Sample>, sender: mpsc::Sender<Sample>) -> usize {
    let mut delivered = 0;
    for sample in samples {
        if sender.send(sample).await.is_err() {
            warn!(delivered, "session stopped receiving samples");
            break;
        }
        delivered += 1;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_samples_parses_kinds() {
        let data = "kind,value,timestamp\nibi,0.5,100.0\n gsr , 0.31 ,100.25\ntemp,33.1,101\n";
        let samples = read_samples(data.as_bytes()).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], Sample::ibi(0.5, 100.0));
        assert_eq!(samples[1].kind, SampleKind::Gsr);
        assert_eq!(samples[2].kind, SampleKind::SkinTemperature);
    }

    #[test]
    fn test_read_samples_reports_line() {
        let data = "kind,value,timestamp\nibi,0.5,100.0\nspo2,97,101\n";
        let err = read_samples(data.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("line 3"));
    }

    #[test]
    fn test_read_samples_csv_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "kind,value,timestamp").unwrap();
        writeln!(file, "bvp,-12.5,10.0").unwrap();
        let samples = read_samples_csv(file.path()).unwrap();
        assert_eq!(samples, vec![Sample::new(SampleKind::Bvp, -12.5, 10.0)]);
    }

    #[tokio::test]
    async fn test_replay_preserves_order() {
        let (tx, mut rx) = sensor_channel(4);
        let samples: Vec<Sample> = (0..10).map(|i| Sample::ibi(0.8, i as f64)).collect();
        let producer = tokio::spawn(replay(samples, tx));

        let mut received = Vec::new();
        while let Some(sample) = rx.recv().await {
            received.push(sample.timestamp);
        }
        assert_eq!(producer.await.unwrap(), 10);
        assert_eq!(received, (0..10).map(|i| i as f64).collect::<Vec<_>>());
    }
}
