use indicatif::{ProgressBar, ProgressStyle};

pub struct ProgressWindow {
    pb: ProgressBar,
    len: usize,
}

impl ProgressWindow {
    pub fn new(steps: usize) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(steps as u64);
        pb.set_style(sty);

        Self { pb, len: steps }
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl neural_style::TransferProgress for ProgressWindow {
    fn update(&mut self, update: neural_style::ProgressUpdate) {
        // The optimizer finishes its iteration before checking the budget,
        // so the last few steps can overshoot it
        if update.step > self.len {
            self.len = update.step;
            self.pb.set_length(self.len as u64);
        }

        self.pb.set_position(update.step as u64);
        self.pb.set_message(&format!(
            "style {:.4} content {:.4}",
            update.scores.style, update.scores.content
        ));
    }
}
