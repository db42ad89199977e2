/// Per-iteration step counter. One "moment" corresponds to one logical
/// tensor-access point; the access pattern of a fixed model and batch size
/// repeats identically every iteration, so the counter wraps at the length
/// learned during warmup.
#[derive(Debug, Default)]
pub struct Metronome {
    moment: usize,
    /// Moments per iteration; 0 until the first warmup iteration completes.
    total_moments: usize,
    warmup: bool,
}

impl Metronome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn moment(&self) -> usize {
        self.moment
    }

    /// Moments recorded in one full iteration (0 before warmup completes).
    pub fn total_moments(&self) -> usize {
        self.total_moments
    }

    /// The index that will follow the current moment, wrapping at iteration
    /// end once the iteration length is known.
    pub fn next_moment(&self) -> usize {
        if self.total_moments == 0 {
            self.moment + 1
        } else {
            (self.moment + 1) % self.total_moments
        }
    }

    pub fn tiktac(&mut self) {
        self.moment = self.next_moment();
    }

    pub fn is_warmup(&self) -> bool {
        self.warmup
    }

    pub fn set_warmup(&mut self, warmup: bool) {
        self.warmup = warmup;
    }

    /// Freeze the iteration length at the current moment count and rewind.
    /// Called once at the end of the warmup iteration.
    pub fn complete_warmup(&mut self) {
        self.total_moments = self.moment;
        self.moment = 0;
        self.warmup = false;
    }

    /// Rewind to moment 0 without touching the learned iteration length.
    /// Used when an aborted warmup iteration must be replayed from scratch.
    pub fn rewind(&mut self) {
        self.moment = 0;
    }
}
