//! Analysis kinds, on-disk artifacts and chain planning.
//!
//! Every stored audio file owns a directory on the shared volume:
//!
//! ```text
//! <volume_root>/<consumer_id>/<audiofile_id>/<audiofile_id>.wav
//! ```
//!
//! Each analysis writes one artifact into that directory. Planning a chain
//! checks that no analysis is repeated and that every upstream artifact is
//! either on disk or produced earlier in the same chain, before anything is
//! enqueued.

use std::path::{Component, Path, PathBuf};

use crate::config::{ServiceSettings, ServicesSettings};
use crate::pipeline::{AnalysisJob, ApiJob};
use crate::{Error, Result};

/// Artifacts found in an audio file directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum Artifact {
    #[strum(serialize = "chord.json")]
    Chords,
    #[strum(serialize = "separated")]
    Separated,
    #[strum(serialize = "spectrograms.npy")]
    Spectrograms,
    #[strum(serialize = "structure")]
    Structure,
    #[strum(serialize = "lyric.txt")]
    Lyrics,
}

impl Artifact {
    /// File or directory name inside the audio file directory.
    pub fn file_name(self) -> &'static str {
        self.into()
    }
}

/// One kind of analysis, as named in request paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AnalysisKind {
    Chord,
    Separation,
    Spectrograms,
    Structure,
    Lyric,
}

impl AnalysisKind {
    /// All kinds in full-analysis order.
    pub const ALL: [AnalysisKind; 5] = [
        Self::Chord,
        Self::Separation,
        Self::Spectrograms,
        Self::Structure,
        Self::Lyric,
    ];

    /// Artifact this analysis writes.
    pub fn produces(self) -> Artifact {
        match self {
            Self::Chord => Artifact::Chords,
            Self::Separation => Artifact::Separated,
            Self::Spectrograms => Artifact::Spectrograms,
            Self::Structure => Artifact::Structure,
            Self::Lyric => Artifact::Lyrics,
        }
    }

    /// Artifacts that must exist before this analysis can run.
    pub fn requires(self) -> &'static [Artifact] {
        match self {
            Self::Chord | Self::Separation => &[],
            Self::Spectrograms | Self::Lyric => &[Artifact::Separated],
            Self::Structure => &[Artifact::Spectrograms],
        }
    }

    fn service(self, services: &ServicesSettings) -> &ServiceSettings {
        match self {
            Self::Chord => &services.crema,
            Self::Separation => &services.demucs,
            Self::Spectrograms => &services.allin1_spectrograms,
            Self::Structure => &services.allin1_structure,
            Self::Lyric => &services.whisper,
        }
    }
}

/// Options of the lyric transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricOptions {
    pub language_code: String,
}

impl Default for LyricOptions {
    fn default() -> Self {
        Self {
            language_code: "ja".to_string(),
        }
    }
}

/// Check an ISO 639-1 style language code: two or three lowercase letters.
pub fn validate_language_code(code: &str) -> Result<()> {
    let valid = (2..=3).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_lowercase());
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid language code {code:?}")))
    }
}

/// Ids used as path segments must be exactly one normal component.
fn validate_segment(kind: &str, value: &str) -> Result<()> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !value.contains(['/', '\\']) => Ok(()),
        _ => Err(Error::validation(format!("invalid {kind} {value:?}"))),
    }
}

/// A stored audio file located on the shared volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFile {
    pub consumer_id: String,
    pub audiofile_id: String,
    pub directory: PathBuf,
    pub path: PathBuf,
}

impl AudioFile {
    /// Locate `<volume_root>/<consumer_id>/<audiofile_id>/<audiofile_id>.wav`.
    ///
    /// A missing consumer directory or audio file is a precondition error.
    pub async fn locate(volume_root: &Path, consumer_id: &str, audiofile_id: &str) -> Result<Self> {
        validate_segment("consumer id", consumer_id)?;
        validate_segment("audio file id", audiofile_id)?;

        let consumer_dir = volume_root.join(consumer_id);
        if !tokio::fs::try_exists(&consumer_dir).await? {
            return Err(Error::precondition(format!(
                "consumer directory for {consumer_id} does not exist"
            )));
        }

        let directory = consumer_dir.join(audiofile_id);
        let path = directory.join(format!("{audiofile_id}.wav"));
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::precondition(format!(
                "audio file {audiofile_id} does not exist"
            )));
        }

        Ok(Self {
            consumer_id: consumer_id.to_string(),
            audiofile_id: audiofile_id.to_string(),
            directory,
            path,
        })
    }

    pub fn artifact_path(&self, artifact: Artifact) -> PathBuf {
        self.directory.join(artifact.file_name())
    }

    pub async fn has_artifact(&self, artifact: Artifact) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.artifact_path(artifact)).await?)
    }

    fn path_string(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// Request body for `kind` on this file.
    pub fn request_body(&self, kind: AnalysisKind, lyric: &LyricOptions) -> AnalysisJob {
        let audio = Self::path_string(&self.path);
        match kind {
            AnalysisKind::Chord => AnalysisJob::Chords { file_path: audio },
            AnalysisKind::Separation => AnalysisJob::Separation { file_path: audio },
            AnalysisKind::Spectrograms => AnalysisJob::Spectrograms {
                separated_path: Self::path_string(&self.artifact_path(Artifact::Separated)),
            },
            AnalysisKind::Structure => AnalysisJob::Structure {
                file_path: audio,
                spectrograms_path: Self::path_string(&self.artifact_path(Artifact::Spectrograms)),
            },
            AnalysisKind::Lyric => AnalysisJob::Lyrics {
                file_path: Self::path_string(
                    &self.artifact_path(Artifact::Separated).join("vocals.wav"),
                ),
                language_code: lyric.language_code.clone(),
            },
        }
    }
}

/// Turns analysis requests into job chains.
#[derive(Debug, Clone)]
pub struct AnalysisPlanner {
    services: ServicesSettings,
}

impl AnalysisPlanner {
    pub fn new(services: ServicesSettings) -> Self {
        Self { services }
    }

    fn api_job(&self, audio: &AudioFile, kind: AnalysisKind, lyric: &LyricOptions) -> ApiJob {
        let service = kind.service(&self.services);
        ApiJob {
            job_name: service.job_name.clone(),
            dst_api_url: service.base_url(),
            queue_name: service.job_queue.clone(),
            request_path: service.request_path.clone(),
            job_timeout_secs: service.job_timeout_secs,
            request_body: audio.request_body(kind, lyric),
            request_headers: Default::default(),
            request_read_timeout_secs: service.read_timeout_secs,
            dst_api_connect_timeout_secs: service.connect_timeout_secs,
        }
    }

    /// Plan a chain running `kinds` in order.
    ///
    /// Fails when an analysis already ran or an upstream artifact is neither
    /// on disk nor produced earlier in the chain.
    pub async fn plan_chain(
        &self,
        audio: &AudioFile,
        kinds: &[AnalysisKind],
        lyric: &LyricOptions,
    ) -> Result<Vec<ApiJob>> {
        if kinds.is_empty() {
            return Err(Error::validation("no analysis requested"));
        }
        if kinds.iter().any(|k| *k == AnalysisKind::Lyric) {
            validate_language_code(&lyric.language_code)?;
        }

        let mut planned: Vec<Artifact> = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let artifact = kind.produces();
            if planned.contains(&artifact) || audio.has_artifact(artifact).await? {
                return Err(Error::precondition(format!(
                    "{} already analyzed: {} exists",
                    kind,
                    artifact.file_name()
                )));
            }
            for &required in kind.requires() {
                if !planned.contains(&required) && !audio.has_artifact(required).await? {
                    return Err(Error::precondition(format!(
                        "{} needs missing upstream artifact {}",
                        kind,
                        required.file_name()
                    )));
                }
            }
            planned.push(artifact);
        }

        Ok(kinds
            .iter()
            .map(|&kind| self.api_job(audio, kind, lyric))
            .collect())
    }

    /// Plan the full analysis of a file.
    ///
    /// Any existing artifact rejects the request, including the lyric
    /// transcript when lyrics are skipped.
    pub async fn plan_full(
        &self,
        audio: &AudioFile,
        analyze_lyric: bool,
        lyric: &LyricOptions,
    ) -> Result<Vec<ApiJob>> {
        for kind in AnalysisKind::ALL {
            let artifact = kind.produces();
            if audio.has_artifact(artifact).await? {
                return Err(Error::precondition(format!(
                    "{} already analyzed: {} exists",
                    kind,
                    artifact.file_name()
                )));
            }
        }

        let kinds: Vec<AnalysisKind> = AnalysisKind::ALL
            .into_iter()
            .filter(|k| analyze_lyric || *k != AnalysisKind::Lyric)
            .collect();
        self.plan_chain(audio, &kinds, lyric).await
    }
}
