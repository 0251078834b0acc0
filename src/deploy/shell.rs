//! Builders for the POSIX shell commands the deployment layer emits
//!
//! Every path and argument goes through [`quote`], so callers can pass
//! arbitrary strings.

use shell_escape::escape;
use std::borrow::Cow;

const HEREDOC_DELIMITER: &str = "BEAR_EOF";

/// Quote one word for a POSIX shell. Safe words are left as they are.
pub fn quote(word: &str) -> String {
    escape(Cow::Borrowed(word)).into_owned()
}

fn quote_all<'a>(words: impl IntoIterator<Item = &'a str>) -> String {
    words.into_iter().map(quote).collect::<Vec<_>>().join(" ")
}

/// Run `command` as root. The whole command line runs under one `sh -c`,
/// so pipes and `&&` stay inside the privileged shell.
pub fn sudo(command: &str) -> String {
    format!("sudo sh -c {}", quote(command))
}

pub fn mkdirs<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    format!("mkdir -p {}", quote_all(paths))
}

pub fn rm<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    format!("rm -rf {}", quote_all(paths))
}

/// Remove everything matching `prefix*` in `dir`
pub fn rm_glob(dir: &str, prefix: &str) -> String {
    format!("rm -rf {}/{}*", quote(dir), quote(prefix))
}

pub fn mv(from: &str, to: &str) -> String {
    format!("mv {} {}", quote(from), quote(to))
}

/// Point `link` at `target`, replacing an existing link
pub fn symlink(target: &str, link: &str) -> String {
    format!("ln -sfn {} {}", quote(target), quote(link))
}

pub fn read_link(link: &str) -> String {
    format!("readlink {}", quote(link))
}

/// Absolute paths of the entries of `dir`, one per line
pub fn ls_abs(dir: &str) -> String {
    let dir = quote(dir);
    format!("for f in {}/*; do [ -e \"$f\" ] && echo \"$f\"; done", dir)
}

pub fn chmod(mode: u32, path: &str) -> String {
    format!("chmod {:o} {}", mode, quote(path))
}

/// Write `content` to `path` through a quoted heredoc, then apply `mode`.
///
/// The heredoc is quoted, so `$` and backticks in `content` are written
/// literally. The delimiter never equals a line of `content`.
pub fn write_file(path: &str, content: &str, mode: Option<u32>) -> String {
    let body = content.strip_suffix('\n').unwrap_or(content);
    let delimiter = heredoc_delimiter(body);

    let mut first_line = format!("cat > {} <<'{}'", quote(path), delimiter);
    if let Some(mode) = mode {
        first_line.push_str(" && ");
        first_line.push_str(&chmod(mode, path));
    }

    format!("{}\n{}\n{}", first_line, body, delimiter)
}

fn heredoc_delimiter(body: &str) -> String {
    let mut delimiter = HEREDOC_DELIMITER.to_string();
    let mut suffix = 0;
    while body.lines().any(|line| line == delimiter) {
        suffix += 1;
        delimiter = format!("{}_{}", HEREDOC_DELIMITER, suffix);
    }
    delimiter
}

/// Chain commands so that the first failure stops the rest
pub fn and_then<S: AsRef<str>>(commands: &[S]) -> String {
    commands
        .iter()
        .map(|c| c.as_ref())
        .collect::<Vec<_>>()
        .join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quote() {
        assert_eq!(quote("/var/lib/app"), "/var/lib/app");
        assert_eq!(quote("with space"), "'with space'");
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_path_commands() {
        assert_eq!(mkdirs(["/a", "/b c"]), "mkdir -p /a '/b c'");
        assert_eq!(rm(["/tmp/x"]), "rm -rf /tmp/x");
        assert_eq!(symlink("/r/releases/1", "/r/current"), "ln -sfn /r/releases/1 /r/current");
        assert_eq!(mv("/a", "/b"), "mv /a /b");
        assert_eq!(chmod(0o755, "/usr/bin/x"), "chmod 755 /usr/bin/x");
        assert_eq!(and_then(&["true", "false"]), "true && false");
    }

    #[test]
    fn test_sudo_wraps_whole_line() {
        assert_eq!(sudo("rm -rf /x && ls"), "sudo sh -c 'rm -rf /x && ls'");
    }

    #[test]
    fn test_write_file() {
        let cmd = write_file("/etc/init/app.conf", "line $1\n", Some(0o644));
        assert_eq!(
            cmd,
            "cat > /etc/init/app.conf <<'BEAR_EOF' && chmod 644 /etc/init/app.conf\nline $1\nBEAR_EOF"
        );
    }

    #[test]
    fn test_write_file_content_cannot_end_heredoc() {
        let content = "line1\nBEAR_EOF\nBEAR_EOF_1\nrm -rf /important";
        let cmd = write_file("/tmp/x", content, None);
        assert_eq!(
            cmd,
            "cat > /tmp/x <<'BEAR_EOF_2'\nline1\nBEAR_EOF\nBEAR_EOF_1\nrm -rf /important\nBEAR_EOF_2"
        );

        let terminators = cmd.lines().filter(|line| *line == "BEAR_EOF_2").count();
        assert_eq!(terminators, 1);
    }
}
