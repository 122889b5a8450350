//! Example of decoding an ANSEL file and writing it back as UTF-16

use gedcom_transport::{Decoder, Encoder, Encoding, LineTerminator};

fn main() -> anyhow::Result<()> {
    println!("=== GEDCOM Transcode Example ===\n");

    // ANSEL puts the acute accent (0xE2) before the letter it modifies
    let mut ansel = b"0 HEAD\r\n1 CHAR ANSEL\r\n0 @I1@ INDI\r\n1 NAME Ren\xE2e /Descartes/\r\n".to_vec();
    ansel.extend_from_slice(b"1 NOTE First line\r\n2 CONT second line\r\n2 CONC , continued\r\n0 TRLR\r\n");

    let mut decoder = Decoder::new().with_read_notification_rate(2)?;
    decoder.register_file_observer(|e| println!("  read: {}", e));
    let mut doc = decoder.decode_bytes(&ansel)?;

    println!("\nDecoded {} records as {}", doc.records().len(), doc.encoding);
    let indi = &doc.records()[1];
    for child in &indi.children {
        println!("  {} = {:?}", child.tag, child.value.as_deref().unwrap_or(""));
    }

    // Write as UTF-16LE with a BOM and a narrow width to force CONC lines
    doc.set_declared_charset(Encoding::Utf16Le);
    let mut encoder = Encoder::new()
        .with_encoding(Encoding::Utf16Le)
        .with_terminator(LineTerminator::Lf)
        .with_byte_order_mark(true)
        .with_max_line_width(16)?;
    let mut utf16 = Vec::new();
    let summary = encoder.encode_document(&doc, &mut utf16)?;
    println!("\nWrote {} lines, {} bytes", summary.lines_written, summary.bytes_written);

    // Read it back and compare the trees
    let again = Decoder::new().decode_bytes(&utf16)?;
    assert_eq!(again.encoding, Encoding::Utf16Le);
    assert!(again.had_bom);
    assert_eq!(again.root, doc.root);

    println!("\nRound-trip verification passed!");
    Ok(())
}
