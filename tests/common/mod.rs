//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kohl::cli_support::HeadlessPrompt;
use kohl::model::{Candidate, DuplicateRequest};
use kohl::ports::{MetadataSource, UserPrompt};
use kohl::render::MarkdownRenderer;
use kohl::{
    Annotation, AppError, BookMetadata, CancelToken, CommentStyle, DuplicateChoice, Engine,
    EnginePorts, RandomUid, Settings, SourceBook, SystemClock,
};

pub fn ann(page: u32, text: &str) -> Annotation {
    Annotation {
        page,
        pos0: format!("{page}.0"),
        pos1: None,
        text: text.to_string(),
        note: None,
        datetime: format!("2024-03-{page:02}T10:00:00Z"),
        color: None,
        draw: None,
    }
}

pub fn odyssey() -> BookMetadata {
    BookMetadata {
        title: "The Odyssey".into(),
        authors: "Homer".into(),
        ..Default::default()
    }
}

/// In-memory metadata source whose books can be swapped between runs.
pub struct StaticSource {
    books: Mutex<Vec<SourceBook>>,
}

impl StaticSource {
    pub fn new(books: Vec<SourceBook>) -> Self {
        Self {
            books: Mutex::new(books),
        }
    }

    pub fn set_books(&self, books: Vec<SourceBook>) {
        *self.books.lock().unwrap() = books;
    }
}

#[async_trait]
impl MetadataSource for StaticSource {
    async fn iter_books(&self, cancel: &CancelToken) -> Result<Vec<SourceBook>, AppError> {
        cancel.check()?;
        Ok(self.books.lock().unwrap().clone())
    }
}

/// Prompt whose answers are queued up front; falls back to headless
/// defaults when the queue runs dry.
#[derive(Default)]
pub struct ScriptedPrompt {
    pub choices: Mutex<VecDeque<DuplicateChoice>>,
    pub stale_answers: Mutex<VecDeque<bool>>,
}

#[async_trait]
impl UserPrompt for ScriptedPrompt {
    async fn choose_duplicate(
        &self,
        request: &DuplicateRequest,
    ) -> Result<DuplicateChoice, AppError> {
        let queued = self.choices.lock().unwrap().pop_front();
        match queued {
            Some(choice) => Ok(choice),
            None => HeadlessPrompt.choose_duplicate(request).await,
        }
    }

    async fn confirm_stale_location(&self, candidate: &Candidate) -> Result<bool, AppError> {
        let queued = self.stale_answers.lock().unwrap().pop_front();
        match queued {
            Some(answer) => Ok(answer),
            None => HeadlessPrompt.confirm_stale_location(candidate).await,
        }
    }
}

pub struct TestVault {
    pub dir: tempfile::TempDir,
    pub managed: PathBuf,
    pub data_dir: PathBuf,
    pub prompt: Arc<ScriptedPrompt>,
}

impl TestVault {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let managed = dir.path().join("highlights");
        let data_dir = dir.path().join(".kohl");
        Self {
            dir,
            managed,
            data_dir,
            prompt: Arc::new(ScriptedPrompt::default()),
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            managed_folder: self.managed.clone(),
            data_dir: self.data_dir.clone(),
            comment_style: CommentStyle::Html,
            ..Settings::default()
        }
    }

    pub async fn engine(&self) -> Engine {
        self.engine_with(self.settings()).await
    }

    pub async fn engine_with(&self, settings: Settings) -> Engine {
        Engine::new(
            settings,
            EnginePorts {
                renderer: Arc::new(MarkdownRenderer),
                prompts: self.prompt.clone(),
                clock: Arc::new(SystemClock),
                ids: Arc::new(RandomUid),
            },
        )
        .await
        .expect("engine construction")
    }

    pub fn source_book(
        &self,
        metadata: BookMetadata,
        annotations: Vec<Annotation>,
        mtime: i64,
    ) -> SourceBook {
        let size = annotations.len() as u64 * 100 + 40;
        SourceBook {
            source_path: self
                .dir
                .path()
                .join("device/odyssey.sdr/metadata.epub.lua"),
            metadata,
            annotations,
            stat: Some(kohl::model::SourceStat { mtime, size }),
        }
    }
}
