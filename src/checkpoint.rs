use std::time::{Duration, Instant};

/// CheckpointTrigger はオフセットコミットの発火判定を表す。
/// 前回リセットからの処理件数が閾値に達するか、経過時間が閾値を超えた
/// 時点で発火し、発火時に両方のカウンターをリセットする。
#[derive(Debug)]
pub(crate) struct CheckpointTrigger {
    count_threshold: u64,
    duration_threshold: Duration,
    count: u64,
    last_reset: Instant,
}

impl CheckpointTrigger {
    pub(crate) fn new(count_threshold: u64, duration_threshold: Duration) -> Self {
        Self {
            count_threshold,
            duration_threshold,
            count: 0,
            last_reset: Instant::now(),
        }
    }

    /// 処理件数を加算し、発火条件を満たした場合 true を返す。
    pub(crate) fn increment(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.count_threshold
            || self.last_reset.elapsed() >= self.duration_threshold
        {
            self.reset();
            return true;
        }
        false
    }

    /// カウンターと経過時間をリセットする。冪等。
    pub(crate) fn reset(&mut self) {
        self.count = 0;
        self.last_reset = Instant::now();
    }
}
