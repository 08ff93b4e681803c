//! Hub module: fetches model and tokenizer files into a local directory

mod downloader;

pub use downloader::{matches_pattern, DownloadReport, Downloader, FileOutcome};
