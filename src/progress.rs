use indicatif::{ProgressBar, ProgressStyle};

/// Spinner for the listing, fetching and trashing phases.
///
/// Each phase draws on its own bar: a cleared bar stays hidden for good,
/// so `finish` drops the current one and the next phase starts fresh.
pub struct ScanProgress {
    bar: Option<ProgressBar>,
    enabled: bool,
}

impl ScanProgress {
    pub fn new(enabled: bool) -> Self {
        Self { bar: None, enabled }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    fn phase_bar(&mut self) -> &ProgressBar {
        self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
            {
                bar.set_style(style);
            }
            bar
        })
    }

    fn update(&mut self, message: String) {
        if self.enabled {
            let bar = self.phase_bar();
            bar.set_message(message);
            bar.tick();
        }
    }

    pub fn listing(&mut self, objects: usize, pages: usize) {
        self.update(format!("Listing objects: {objects} ({pages} pages)"));
    }

    pub fn fetching(&mut self, done: usize, total: usize) {
        self.update(format!("Fetching metadata: {done}/{total}"));
    }

    pub fn trashing(&mut self, done: usize, total: usize) {
        self.update(format!("Moving to trash: {done}/{total}"));
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
