//! Read an SRT file, drop noise cues and print it renumbered.
//!
//! Usage: cargo run --example formats -- path/to/movie.en.srt

fn main() -> srtgen::Result<()> {
    let path = std::env::args()
        .nth(1)
        .expect("usage: formats <srt-file>");

    let raw = std::fs::read_to_string(&path)?;
    let mut cues = srtgen::srt::decode(&raw)?;
    let before = cues.len();
    cues.retain(|cue| !srtgen::srt::is_noise_marker(&cue.text));
    srtgen::srt::renumber(&mut cues);

    eprintln!("{} cues, {} noise markers dropped", cues.len(), before - cues.len());
    print!("{}", srtgen::srt::encode(&cues)?);
    Ok(())
}
