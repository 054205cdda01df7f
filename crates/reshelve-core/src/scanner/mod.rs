mod walk;

pub use walk::{scan, DateEnricher, NoEnrichment, Scan, ScanOptions, ScanSkip};
