use serde::{Deserialize, Serialize};

/// A time interval in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoSegment {
    pub start: f64,
    pub end: f64,
}

impl VideoSegment {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Accumulates silence intervals from ffmpeg silencedetect output
#[derive(Debug, Default)]
pub struct SilenceTracker {
    segments: Vec<VideoSegment>,
    open_start: Option<f64>,
}

impl SilenceTracker {
    pub fn feed_line(&mut self, line: &str) {
        if let Some(segment) = parse_silence_end(line) {
            self.segments.push(segment);
            self.open_start = None;
        } else if let Some(start) = parse_value(line, "silence_start:") {
            self.open_start = Some(start.max(0.0));
        }
    }

    pub fn segments(&self) -> &[VideoSegment] {
        &self.segments
    }

    /// Closes a silence still open when the recording stopped
    pub fn finish(mut self, duration: f64) -> Vec<VideoSegment> {
        if let Some(start) = self.open_start.take() {
            if start < duration {
                self.segments.push(VideoSegment::new(start, duration));
            }
        }
        self.segments
    }
}

fn parse_value(line: &str, key: &str) -> Option<f64> {
    let at = line.find(key)?;
    line[at + key.len()..]
        .split_whitespace()
        .next()?
        .trim_end_matches('|')
        .parse()
        .ok()
}

/// `... silence_end: X | silence_duration: Y` becomes the interval `[X - Y, X]`
pub fn parse_silence_end(line: &str) -> Option<VideoSegment> {
    let end = parse_value(line, "silence_end:")?;
    let duration = parse_value(line, "silence_duration:")?;
    Some(VideoSegment::new((end - duration).max(0.0), end))
}

/// Sorts and merges intervals that overlap or touch
pub fn merge_segments(segments: &[VideoSegment]) -> Vec<VideoSegment> {
    let mut sorted: Vec<VideoSegment> = segments.iter()
        .copied()
        .filter(|s| s.end > s.start)
        .collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<VideoSegment> = Vec::with_capacity(sorted.len());
    for segment in sorted {
        match merged.last_mut() {
            Some(last) if segment.start <= last.end => {
                last.end = last.end.max(segment.end);
            }
            _ => merged.push(segment),
        }
    }
    merged
}

/// Complement of `silence` within `[0, duration]`; empty unless `duration`
/// is a positive finite number
pub fn invert_segments(silence: &[VideoSegment], duration: f64) -> Vec<VideoSegment> {
    if !(duration.is_finite() && duration > 0.0) {
        return Vec::new();
    }
    let clamped: Vec<VideoSegment> = silence.iter()
        .map(|s| VideoSegment::new(s.start.clamp(0.0, duration), s.end.clamp(0.0, duration)))
        .collect();

    let mut sound = Vec::new();
    let mut cursor = 0.0;
    for segment in merge_segments(&clamped) {
        if segment.start > cursor {
            sound.push(VideoSegment::new(cursor, segment.start));
        }
        cursor = segment.end;
    }
    if cursor < duration {
        sound.push(VideoSegment::new(cursor, duration));
    }
    sound
}

/// Widens every interval by `delta` on both sides, clamped to `[0, duration]`,
/// then merges whatever now overlaps
pub fn extend_and_merge_segments(segments: &[VideoSegment], delta: f64, duration: f64) -> Vec<VideoSegment> {
    let extended: Vec<VideoSegment> = segments.iter()
        .map(|s| VideoSegment::new((s.start - delta).max(0.0), (s.end + delta).min(duration)))
        .collect();
    merge_segments(&extended)
}

/// One timestamp per shot: the onset of each sound interval
pub fn shot_timestamps(sound: &[VideoSegment]) -> Vec<f64> {
    sound.iter().map(|s| s.start).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64) -> VideoSegment {
        VideoSegment::new(start, end)
    }

    fn assert_segments(actual: &[VideoSegment], expected: &[VideoSegment]) {
        assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
        for (a, e) in actual.iter().zip(expected) {
            assert!((a.start - e.start).abs() < 1e-9 && (a.end - e.end).abs() < 1e-9, "{:?} vs {:?}", actual, expected);
        }
    }

    #[test]
    fn test_invert_rejects_unusable_duration() {
        let silence = [seg(1.0, 2.0)];
        assert!(invert_segments(&silence, -1.0).is_empty());
        assert!(invert_segments(&silence, f64::NAN).is_empty());
        assert!(invert_segments(&silence, f64::INFINITY).is_empty());
        assert!(invert_segments(&silence, 0.0).is_empty());
        assert_segments(&invert_segments(&silence, 3.0), &[seg(0.0, 1.0), seg(2.0, 3.0)]);
    }

    #[test]
    fn test_parse_silencedetect_lines() {
        let mut tracker = SilenceTracker::default();
        tracker.feed_line("[silencedetect @ 0x55d0c8c3a5c0] silence_start: 2");
        tracker.feed_line("[silencedetect @ 0x55d0c8c3a5c0] silence_end: 3 | silence_duration: 1");
        tracker.feed_line("frame=  250 fps= 25 q=-1.0 size=    1024kB time=00:00:10.00");
        tracker.feed_line("[silencedetect @ 0x55d0c8c3a5c0] silence_start: 9.2");
        assert_segments(tracker.segments(), &[seg(2.0, 3.0)]);

        let closed = tracker.finish(10.0);
        assert_segments(&closed, &[seg(2.0, 3.0), seg(9.2, 10.0)]);

        assert!(parse_silence_end("silence_end: abc | silence_duration: 1").is_none());
    }

    #[test]
    fn test_scenario_full_collapse() {
        let silence = [seg(2.0, 3.0), seg(7.0, 7.5)];
        let sound = invert_segments(&silence, 10.0);
        assert_segments(&sound, &[seg(0.0, 2.0), seg(3.0, 7.0), seg(7.5, 10.0)]);

        let merged = extend_and_merge_segments(&sound, 1.0, 10.0);
        assert_segments(&merged, &[seg(0.0, 10.0)]);
    }

    #[test]
    fn test_invert_is_complement() {
        let cases: Vec<(Vec<VideoSegment>, f64)> = vec![
            (vec![], 5.0),
            (vec![seg(0.0, 1.0), seg(4.0, 5.0)], 5.0),
            (vec![seg(0.5, 1.5), seg(2.0, 2.25), seg(8.0, 9.0)], 12.0),
            (vec![seg(0.0, 12.0)], 12.0),
        ];

        for (silence, duration) in cases {
            let sound = invert_segments(&silence, duration);
            let mut all: Vec<VideoSegment> = silence.iter().chain(sound.iter()).copied().collect();
            all.sort_by(|a, b| a.start.total_cmp(&b.start));

            let mut cursor = 0.0;
            for s in &all {
                assert!((s.start - cursor).abs() < 1e-9, "gap or overlap at {} in {:?}", cursor, all);
                cursor = s.end;
            }
            assert!((cursor - duration).abs() < 1e-9);
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let input = [seg(5.0, 6.0), seg(0.0, 2.0), seg(1.0, 3.0), seg(3.0, 4.0), seg(8.0, 9.0)];
        let once = merge_segments(&input);
        assert_segments(&once, &[seg(0.0, 4.0), seg(5.0, 6.0), seg(8.0, 9.0)]);
        assert_segments(&merge_segments(&once), &once);
    }

    #[test]
    fn test_extend_and_merge_fixed_points() {
        let sound = [seg(1.0, 2.0), seg(6.0, 7.0)];
        let zero = extend_and_merge_segments(&sound, 0.0, 10.0);
        assert_segments(&extend_and_merge_segments(&zero, 0.0, 10.0), &zero);

        let full = [seg(0.0, 10.0)];
        assert_segments(&extend_and_merge_segments(&full, 1.0, 10.0), &full);
    }

    #[test]
    fn test_extend_keeps_distant_segments_apart() {
        let sound = [seg(1.0, 2.0), seg(6.0, 7.0)];
        let merged = extend_and_merge_segments(&sound, 1.0, 7.5);
        assert_segments(&merged, &[seg(0.0, 3.0), seg(5.0, 7.5)]);
        assert_eq!(shot_timestamps(&sound), vec![1.0, 6.0]);
    }
}
