/// Aggregate transition of the uploading set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The uploading set went from empty to non-empty
    Started,
    /// The uploading set drained back to empty
    Complete,
}

/// Edge-triggered "uploads in progress" flag.
///
/// Fires once per change between an empty and a non-empty uploading set, no
/// matter how many files start or finish in between.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    in_progress: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn observe(&mut self, uploading_count: usize) -> Option<Transition> {
        let busy = uploading_count > 0;
        if busy == self.in_progress {
            return None;
        }

        self.in_progress = busy;
        if busy {
            log::debug!("Progress: uploads started ({} active)", uploading_count);
            Some(Transition::Started)
        } else {
            log::debug!("Progress: all uploads finished");
            Some(Transition::Complete)
        }
    }
}
