#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable shell script to `dir/name`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Stand-in for `llvm-profdata merge -sparse <in...> -o <out>`: concatenates
/// its inputs and rejects any input containing `CORRUPT`.
pub const FAKE_MERGE_TOOL: &str = r#"
[ "$1" = merge ] || exit 64
shift
[ "$1" = -sparse ] || exit 64
shift
out=""
ins=""
while [ $# -gt 0 ]; do
  if [ "$1" = -o ]; then out="$2"; shift 2; continue; fi
  ins="$ins $1"
  shift
done
[ -n "$out" ] || exit 64
for f in $ins; do
  if grep -q CORRUPT "$f"; then echo "malformed profile $f" >&2; exit 1; fi
done
cat $ins > "$out.tmp" && mv "$out.tmp" "$out"
"#;

/// Stand-in for an instrumented fuzzer. Every argument after the flags is a
/// corpus file or directory; each file's content decides what happens:
/// `crash` exits 1 with no profile, `hang` sleeps, `silent` exits cleanly
/// without a profile, anything else is appended to the profile. Every
/// invocation is logged to `$FUZZCOV_INVOCATIONS` when set.
pub const FAKE_FUZZER: &str = r#"
[ -n "$FUZZCOV_INVOCATIONS" ] && echo "$*" >> "$FUZZCOV_INVOCATIONS"
files=""
for a in "$@"; do
  case "$a" in
    -*) ;;
    *) if [ -d "$a" ]; then
         for f in "$a"/*; do [ -f "$f" ] && files="$files $f"; done
       else
         files="$files $a"
       fi ;;
  esac
done
cov=""
for f in $files; do
  case "$(cat "$f")" in
    crash) exit 1 ;;
    hang) sleep 30 ;;
    silent) ;;
    *) cov="$cov$(cat "$f");" ;;
  esac
done
[ -n "$cov" ] || exit 0
out=$(printf '%s' "$LLVM_PROFILE_FILE" | sed "s/%p/$$/")
printf '%s\n' "$cov" > "$out"
"#;
