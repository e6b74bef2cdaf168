#![forbid(unsafe_code)]

//! Chapter markers embedded into downloaded files.
//!
//! Embedding is best effort: any failure logs a warning and the caller keeps
//! serving the original file.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{info, warn};

use crate::{
    metadata::Chapter,
    tools::{Transcoder, run_with_timeout},
};

const METADATA_FILE: &str = "chapters_metadata.txt";

/// Escapes a value for the ffmetadata format. Backslashes go first so the
/// escapes added for the other characters are not doubled.
pub fn escape_metadata(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '=' | ';' | '#' | '\n') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Renders chapters as an ffmetadata document with millisecond timebase.
pub fn metadata_document(chapters: &[Chapter]) -> String {
    let mut document = String::from(";FFMETADATA1\n");
    for chapter in chapters {
        let start = (chapter.start_seconds.max(0.0) * 1000.0) as u64;
        let end = (chapter.end_seconds.max(0.0) * 1000.0) as u64;
        let _ = write!(
            document,
            "\n[CHAPTER]\nTIMEBASE=1/1000\nSTART={start}\nEND={end}\ntitle={}\n",
            escape_metadata(&chapter.title)
        );
    }
    document
}

fn chaptered_path(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let name = match file.extension() {
        Some(ext) => format!("{stem}_with_chapters.{}", ext.to_string_lossy()),
        None => format!("{stem}_with_chapters"),
    };
    file.with_file_name(name)
}

/// Writes `chapters` into a copy of `file` and returns the path to serve.
///
/// On success the original file is deleted and the new path returned. On any
/// failure the partial output is removed and `file` is returned unchanged.
pub fn embed(
    transcoder: &Transcoder,
    file: &Path,
    chapters: &[Chapter],
    workspace_dir: &Path,
) -> PathBuf {
    if chapters.is_empty() {
        return file.to_path_buf();
    }
    let Some(binary) = transcoder.binary() else {
        return file.to_path_buf();
    };

    let metadata_path = workspace_dir.join(METADATA_FILE);
    if let Err(err) = fs::write(&metadata_path, metadata_document(chapters)) {
        warn!("could not write chapter metadata: {err}");
        return file.to_path_buf();
    }

    let output = chaptered_path(file);
    let mut command = Command::new(binary);
    command
        .args(["-nostdin", "-loglevel", "error", "-i"])
        .arg(file)
        .arg("-i")
        .arg(&metadata_path)
        .args([
            "-map",
            "0",
            "-map_metadata",
            "1",
            "-map_chapters",
            "1",
            "-codec",
            "copy",
            "-y",
        ])
        .arg(&output);

    let result = run_with_timeout(command, transcoder.timeout());
    let _ = fs::remove_file(&metadata_path);

    let failure = match result {
        Ok(run) if run.status.success() && output.is_file() => None,
        Ok(run) if run.status.success() => Some("transcoder produced no output".to_string()),
        Ok(run) => Some(format!("transcoder exited with {}: {}", run.status, run.stderr.trim())),
        Err(err) => Some(err.to_string()),
    };
    if let Some(reason) = failure {
        warn!(file = %file.display(), "chapter embedding skipped: {reason}");
        let _ = fs::remove_file(&output);
        return file.to_path_buf();
    }

    if let Err(err) = fs::remove_file(file) {
        warn!(file = %file.display(), "could not remove pre-chapter file: {err}");
    }
    info!(chapters = chapters.len(), "embedded chapter markers");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::format_timestamp;

    fn chapter(index: usize, title: &str, start: f64, end: f64) -> Chapter {
        Chapter {
            index,
            title: title.to_string(),
            start_seconds: start,
            end_seconds: end,
            start_formatted: format_timestamp(Some(start)),
            end_formatted: format_timestamp(Some(end)),
            duration_seconds: end - start,
            duration_formatted: format_timestamp(Some(end - start)),
        }
    }

    #[test]
    fn escape_handles_every_special_character() {
        assert_eq!(escape_metadata("a=b;c#d\\e\nf"), "a\\=b\\;c\\#d\\\\e\\\nf");
        assert_eq!(escape_metadata("plain title"), "plain title");
        assert_eq!(escape_metadata("\\="), "\\\\\\=");
    }

    #[test]
    fn document_lists_chapters_in_milliseconds() {
        let document = metadata_document(&[
            chapter(0, "Intro", 0.0, 12.5),
            chapter(1, "Part=2", 12.5, 60.0),
        ]);
        assert!(document.starts_with(";FFMETADATA1\n"));
        assert!(document.contains("START=0\nEND=12500\ntitle=Intro\n"));
        assert!(document.contains("START=12500\nEND=60000\ntitle=Part\\=2\n"));
        assert_eq!(document.matches("[CHAPTER]").count(), 2);
    }

    #[test]
    fn chaptered_path_keeps_extension() {
        assert_eq!(
            chaptered_path(Path::new("/w/My Video.mp4")),
            PathBuf::from("/w/My Video_with_chapters.mp4")
        );
    }

    #[test]
    fn no_transcoder_or_no_chapters_returns_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        fs::write(&file, b"video").unwrap();

        let chapters = [chapter(0, "Intro", 0.0, 5.0)];
        assert_eq!(embed(&Transcoder::unavailable(), &file, &chapters, dir.path()), file);
        assert_eq!(embed(&Transcoder::at("/bin/false"), &file, &[], dir.path()), file);
        assert!(file.exists());
    }

    #[cfg(unix)]
    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("ffmpeg-stub");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn failing_transcoder_keeps_original() {
        let tools = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let file = workspace.path().join("clip.mp4");
        fs::write(&file, b"video").unwrap();
        let stub = install_stub(tools.path(), "echo 'bad input' >&2\nexit 1");

        let served = embed(
            &Transcoder::at(stub),
            &file,
            &[chapter(0, "Intro", 0.0, 5.0)],
            workspace.path(),
        );
        assert_eq!(served, file);
        assert!(file.exists());
        assert!(!workspace.path().join(METADATA_FILE).exists());
        assert!(!workspace.path().join("clip_with_chapters.mp4").exists());
    }

    #[cfg(unix)]
    #[test]
    fn successful_transcoder_replaces_original() {
        let tools = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let file = workspace.path().join("clip.mp4");
        fs::write(&file, b"video").unwrap();
        // The output path is the last argument.
        let stub = install_stub(tools.path(), "for last; do :; done\necho chaptered > \"$last\"");

        let served = embed(
            &Transcoder::at(stub),
            &file,
            &[chapter(0, "Intro", 0.0, 5.0)],
            workspace.path(),
        );
        assert_eq!(served, workspace.path().join("clip_with_chapters.mp4"));
        assert!(!file.exists());
        assert_eq!(fs::read_to_string(&served).unwrap().trim(), "chaptered");
    }

    #[cfg(unix)]
    #[test]
    fn hung_transcoder_times_out() {
        let tools = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let file = workspace.path().join("clip.mp4");
        fs::write(&file, b"video").unwrap();
        let stub = install_stub(tools.path(), "exec sleep 5");

        let transcoder = Transcoder::at(stub).with_timeout(std::time::Duration::from_millis(200));
        let served = embed(&transcoder, &file, &[chapter(0, "Intro", 0.0, 5.0)], workspace.path());
        assert_eq!(served, file);
        assert!(file.exists());
    }
}
