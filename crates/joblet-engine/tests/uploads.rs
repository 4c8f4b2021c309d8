//! Tests for the upload pipe, driven end to end: a transport-side writer
//! streaming chunks into the FIFO while a materialiser (standing in for
//! the sandbox init process) drains it to its destination.

use std::path::PathBuf;

use joblet_core::UploadSpec;
use joblet_engine::UploadSink;
use joblet_engine::create_pipes;
use joblet_engine::materialise_uploads;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn chunked_uploads_materialise_in_order() {
    let pipes_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();

    let destination = dest_dir.path().join("dataset.csv");
    let uploads = vec![UploadSpec {
        index: 0,
        destination: destination.clone(),
        mode: 0o600,
        size: 18,
    }];
    let pipes = create_pipes(pipes_dir.path(), &uploads).unwrap();

    // The materialiser blocks in FIFO reads until the writer's bytes
    // arrive, exactly as the init process does before exec.
    let materialiser = {
        let pipes_dir = pipes_dir.path().to_path_buf();
        let uploads = uploads.clone();
        std::thread::spawn(move || materialise_uploads(&pipes_dir, &uploads))
    };

    let mut sink = UploadSink::open(pipes[0].clone()).await.unwrap();
    for chunk in [&b"id,value\n"[..], &b"1,a\n"[..], &b"2,b\n"[..]] {
        sink.write_chunk(chunk).await.unwrap();
    }
    sink.finish().await.unwrap();

    materialiser.join().unwrap().unwrap();
    assert_eq!(
        std::fs::read_to_string(&destination).unwrap(),
        "id,value\n1,a\n2,b\n"
    );
}

#[tokio::test]
async fn multiple_uploads_materialise_in_index_order() {
    let pipes_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();

    let destinations: Vec<PathBuf> = (0..3)
        .map(|i| dest_dir.path().join(format!("file{i}")))
        .collect();
    let uploads: Vec<UploadSpec> = destinations
        .iter()
        .enumerate()
        .map(|(index, destination)| UploadSpec {
            index,
            destination: destination.clone(),
            mode: 0o644,
            size: 1,
        })
        .collect();
    let pipes = create_pipes(pipes_dir.path(), &uploads).unwrap();

    let materialiser = {
        let pipes_dir = pipes_dir.path().to_path_buf();
        let uploads = uploads.clone();
        std::thread::spawn(move || materialise_uploads(&pipes_dir, &uploads))
    };

    // The materialiser consumes FIFOs in index order, but the transport
    // may open them in any order; writers only unblock as their FIFO is
    // reached.
    for (index, pipe) in pipes.iter().enumerate() {
        let mut sink = UploadSink::open(pipe.clone()).await.unwrap();
        sink.write_chunk(format!("{index}").as_bytes()).await.unwrap();
        sink.finish().await.unwrap();
    }

    materialiser.join().unwrap().unwrap();
    for (index, destination) in destinations.iter().enumerate() {
        assert_eq!(
            std::fs::read_to_string(destination).unwrap(),
            index.to_string()
        );
    }
}
