use benchlog_ingest::corpus::{Corpus, CorpusEntry, ScanReport};

pub fn print_corpus(corpus: &Corpus) {
    println!("family\tentries");
    for (family, entry) in corpus.iter() {
        let unit = match entry {
            CorpusEntry::Table(_) => "rows",
            CorpusEntry::Migration(_) => "runs",
        };
        println!("{family}\t{} {unit}", entry.len());
    }
}

pub fn print_scan(scan: &ScanReport) {
    println!();
    println!(
        "scanned {} logs: {} ingested, {} skipped, {} failed",
        scan.scanned,
        scan.ingested_total(),
        scan.skipped_total(),
        scan.failed.len()
    );

    for (family, count) in &scan.ingested {
        println!("  ingested {family}: {count}");
    }
    for (reason, count) in &scan.skipped {
        println!("  skipped ({reason}): {count}");
    }
    for (path, reason) in &scan.failed {
        println!("  failed {}: {reason}", path.to_string_lossy());
    }
}
