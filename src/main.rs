//! The Joblet daemon binary.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

#[tokio::main]
async fn main() {
    joblet::joblet_main().await
}
