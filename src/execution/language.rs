//! Supported languages.
//!
//! Each language maps to a runtime image, the file the payload is written to
//! inside the scratch mount, and the command that runs it. Adding a language
//! means adding a variant and a row to [`Language::profile`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;

/// Writable scratch mount inside every container.
pub const SCRATCH_DIR: &str = "/scratch";

/// Env var that carries the base64-encoded payload into the container.
pub const PAYLOAD_ENV: &str = "SOURCE_B64";

/// A language a submission may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Ruby,
    Bash,
    Go,
    Cpp,
}

/// Static description of how a language is executed.
#[derive(Debug, Clone, Copy)]
pub struct LanguageProfile {
    /// Runtime image reference.
    pub image: &'static str,
    /// File name the payload is decoded into, relative to [`SCRATCH_DIR`].
    pub source_file: &'static str,
    /// Shell command run after the payload is in place.
    pub run: &'static str,
    /// Extra environment for the toolchain. The root filesystem is read-only,
    /// so anything that writes temporary files must be pointed at scratch.
    pub env: &'static [&'static str],
}

impl Language {
    /// Every supported language.
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::Ruby,
        Language::Bash,
        Language::Go,
        Language::Cpp,
    ];

    /// Execution profile for this language.
    pub fn profile(&self) -> LanguageProfile {
        match self {
            Language::Python => LanguageProfile {
                image: "python:3.12-slim",
                source_file: "main.py",
                run: "python3 -u /scratch/main.py",
                env: &["PYTHONDONTWRITEBYTECODE=1", "TMPDIR=/scratch"],
            },
            Language::JavaScript => LanguageProfile {
                image: "node:20-alpine",
                source_file: "main.js",
                run: "node /scratch/main.js",
                env: &["TMPDIR=/scratch"],
            },
            Language::Ruby => LanguageProfile {
                image: "ruby:3.3-alpine",
                source_file: "main.rb",
                run: "ruby /scratch/main.rb",
                env: &["TMPDIR=/scratch"],
            },
            Language::Bash => LanguageProfile {
                image: "bash:5",
                source_file: "main.sh",
                run: "bash /scratch/main.sh",
                env: &["TMPDIR=/scratch"],
            },
            Language::Go => LanguageProfile {
                image: "golang:1.22-alpine",
                source_file: "main.go",
                run: "go run /scratch/main.go",
                env: &[
                    "HOME=/scratch",
                    "TMPDIR=/scratch",
                    "GOTMPDIR=/scratch",
                    "GOCACHE=/scratch/.gocache",
                    "GOPATH=/scratch/go",
                ],
            },
            Language::Cpp => LanguageProfile {
                image: "gcc:13",
                source_file: "main.cpp",
                run: "g++ -O2 -o /scratch/main /scratch/main.cpp && /scratch/main",
                // cc1plus and as write intermediates to TMPDIR.
                env: &["TMPDIR=/scratch"],
            },
        }
    }

    /// Image reference for this language.
    pub fn image(&self) -> &'static str {
        self.profile().image
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Ruby => "ruby",
            Language::Bash => "bash",
            Language::Go => "go",
            Language::Cpp => "cpp",
        }
    }

    /// Container entrypoint: decode the payload into scratch, then `exec` a
    /// shell running the language's command. The exec replaces the PID 1
    /// shell, so signals sent to the container reach the run command's shell.
    pub fn entrypoint(&self) -> Vec<String> {
        let profile = self.profile();
        let script = format!(
            "printf %s \"${env}\" | base64 -d > {dir}/{file} && unset {env} && exec sh -c '{run}'",
            env = PAYLOAD_ENV,
            dir = SCRATCH_DIR,
            file = profile.source_file,
            run = profile.run,
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "ruby" | "rb" => Ok(Language::Ruby),
            "bash" | "sh" => Ok(Language::Bash),
            "go" | "golang" => Ok(Language::Go),
            "cpp" | "c++" => Ok(Language::Cpp),
            _ => Err(AdmissionError::UnsupportedLanguage(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("Python3".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("node".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("c++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("golang".parse::<Language>().unwrap(), Language::Go);
    }

    #[test]
    fn test_parse_unsupported() {
        let err = "cobol".parse::<Language>().unwrap_err();
        assert_eq!(err, AdmissionError::UnsupportedLanguage("cobol".to_string()));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for lang in Language::ALL {
            assert_eq!(lang.to_string().parse::<Language>().unwrap(), lang);
        }
    }

    #[test]
    fn test_entrypoint_decodes_into_scratch() {
        let cmd = Language::Python.entrypoint();
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert!(cmd[2].contains("base64 -d > /scratch/main.py"));
        assert!(cmd[2].contains("exec sh -c 'python3 -u /scratch/main.py'"));
    }

    #[test]
    fn test_every_profile_writes_into_scratch() {
        for lang in Language::ALL {
            let profile = lang.profile();
            assert!(profile.run.contains(&format!("/scratch/{}", profile.source_file)));
            assert!(!profile.image.is_empty());
        }
    }

    #[test]
    fn test_toolchain_temp_files_go_to_scratch() {
        let tmpdir = format!("TMPDIR={SCRATCH_DIR}");
        for lang in Language::ALL {
            assert!(
                lang.profile().env.contains(&tmpdir.as_str()),
                "{lang} would write temp files to the read-only root"
            );
        }
        let go = Language::Go.profile();
        assert!(go.env.contains(&"GOTMPDIR=/scratch"));
        assert!(go.env.iter().all(|e| e.contains("=/scratch")));
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Language::JavaScript).unwrap();
        assert_eq!(json, "\"javascript\"");
    }
}
