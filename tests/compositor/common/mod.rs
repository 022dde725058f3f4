//! Scripted stand-in for the compositor binary.
//!
//! The script speaks the real wire format: JSON request lines in, framed
//! responses out. Every request type it sees is appended to a log file so
//! tests can tell whether a command reached the worker.
//!
//! `Echo` messages double as control knobs:
//! - `hold`     park the request without answering
//! - `release`  answer this request, then the parked one (out of order)
//! - `crash`    write to stderr and exit with code 7
//! - `garbage`  reply with an unparsable frame header
//! - `stray`    reply to an unknown nonce first, then to the real one
//! - `chatter`  print a log line to stdout before the frame
//! - `slow`     answer after one second

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use compositor_bridge::compositor::protocol::{Command, EchoParams};
use compositor_bridge::{start_compositor, CompositorHandle, CompositorSettings};
use tempfile::TempDir;

const SCRIPT: &str = r#"
log="$1"
held=""

respond() {
    printf 'remotion_buffer:%s:%s:%s:%s' "$1" "${#3}" "$2" "$3"
}

fail() {
    respond "$1" 1 "{\"error\":\"$2\",\"backtrace\":\"\"}"
}

field() {
    printf '%s\n' "$line" | sed -n "s/.*\"$1\":\"\([^\"]*\)\".*/\1/p"
}

while IFS= read -r line; do
    if [ "$line" = "EOF" ]; then
        exit 0
    fi

    nonce=$(printf '%s\n' "$line" | sed -n 's/^{"nonce":"\([^"]*\)".*/\1/p')
    type=$(field type)
    printf '%s\n' "$type" >> "$log"

    case "$type" in
        Echo)
            message=$(field message)
            case "$message" in
                hold)
                    held="$nonce"
                    ;;
                release)
                    respond "$nonce" 0 "released"
                    if [ -n "$held" ]; then
                        respond "$held" 0 "held"
                        held=""
                    fi
                    ;;
                crash)
                    echo "boom: worker panicked" >&2
                    exit 7
                    ;;
                garbage)
                    printf 'remotion_buffer:%s:notanumber:0:' "$nonce"
                    ;;
                stray)
                    respond "nobody" 0 "lost"
                    respond "$nonce" 0 "$message"
                    ;;
                chatter)
                    printf 'hello from the worker\n'
                    respond "$nonce" 0 "$message"
                    ;;
                slow)
                    sleep 1
                    respond "$nonce" 0 "$message"
                    ;;
                *)
                    respond "$nonce" 0 "$message"
                    ;;
            esac
            ;;
        GetVideoMetadata)
            src=$(field src)
            case "$src" in
                *framer-24fps.mp4)
                    respond "$nonce" 0 '{"fps":24,"width":1080,"height":1080,"durationInSeconds":4.166667,"codec":"h264","canPlayInVideoTag":true,"supportsSeeking":true,"colorSpace":"bt601","audioCodec":null,"audioFileExtension":null,"pixelFormat":"yuv420p"}'
                    ;;
                *.mp3)
                    fail "$nonce" "No video stream found"
                    ;;
                *)
                    fail "$nonce" "No such file or directory (os error 2)"
                    ;;
            esac
            ;;
        ExtractFrame)
            at=$(printf '%s\n' "$line" | sed -n 's/.*"time":\([0-9.]*\).*/\1/p')
            respond "$nonce" 0 "FRAME@$at"
            ;;
        GetOpenVideoStats)
            respond "$nonce" 0 '{"openVideos":1,"openStreams":2,"framesInCache":3}'
            ;;
        GetSilences)
            respond "$nonce" 0 '{"silentParts":[{"startInSeconds":0,"endInSeconds":1.5}],"durationInSeconds":4}'
            ;;
        FreeUpMemory|CloseAllVideos|ExtractAudio)
            respond "$nonce" 0 ""
            ;;
        *)
            fail "$nonce" "Unknown command: $type"
            ;;
    esac
done
"#;

/// A stand-in worker living in a temporary directory.
pub struct FakeWorker {
    _dir: TempDir,
    script: PathBuf,
    log: PathBuf,
}

impl FakeWorker {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-compositor.sh");
        let log = dir.path().join("requests.log");
        fs::write(&script, SCRIPT).unwrap();
        fs::write(&log, "").unwrap();
        Self {
            _dir: dir,
            script,
            log,
        }
    }

    /// Settings that launch this worker through `/bin/sh`.
    pub fn settings(&self) -> CompositorSettings {
        CompositorSettings {
            binary_path: Some("/bin/sh".to_string()),
            extra_args: vec![
                self.script.display().to_string(),
                self.log.display().to_string(),
            ],
            shutdown_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    /// Request types the worker has received, in order.
    pub fn requests(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, command_type: &str) -> usize {
        self.requests().iter().filter(|t| *t == command_type).count()
    }

    pub async fn start(&self) -> CompositorHandle {
        start_compositor(&self.settings()).await.unwrap()
    }

    pub async fn start_with(&self, settings: CompositorSettings) -> CompositorHandle {
        start_compositor(&settings).await.unwrap()
    }
}

pub fn echo(message: &str) -> Command {
    Command::Echo(EchoParams {
        message: message.to_string(),
    })
}

/// Poll until `condition` holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
