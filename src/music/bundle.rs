use crate::music::request::{shorten, suppress_embed, LifecycleStage, MediaRequest};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Maximum characters kept of any display string
const MAX_DISPLAY_LENGTH: usize = 256;

/// One tracked request inside a bundle
#[derive(Debug, Clone)]
pub struct BundleRow {
    pub request_id: Uuid,
    pub display: String,
    pub stage: LifecycleStage,
    pub failure_reason: Option<String>,
    /// Line slot assigned at freeze, None for rows that never render
    /// (discarded before display)
    pub slot: Option<(usize, usize)>,
    text: String,
}

impl BundleRow {
    fn render_text(&self) -> String {
        match self.stage {
            // A re-queued row after a retryable failure keeps the retry
            // label visible; internally it is simply queued again
            LifecycleStage::Queued if self.failure_reason.is_some() => format!(
                "Media request failed download, will retry: \"{}\"",
                self.display
            ),
            LifecycleStage::Searching | LifecycleStage::Queued => {
                format!("Media request queued for download: \"{}\"", self.display)
            }
            LifecycleStage::Backoff => format!(
                "Waiting for backoff time before processing media request: \"{}\"",
                self.display
            ),
            LifecycleStage::InProgress => format!(
                "Downloading and processing media request: \"{}\"",
                self.display
            ),
            // Finished rows clear to a blank line, preserving alignment
            LifecycleStage::Completed | LifecycleStage::Discarded => String::new(),
            LifecycleStage::Failed => match &self.failure_reason {
                Some(reason) => format!(
                    "Media request failed download: \"{}\", {reason}",
                    self.display
                ),
                None => format!("Media request failed download: \"{}\"", self.display),
            },
        }
    }
}

/// User-visible grouping of one or more media requests with stable
/// paginated display.
///
/// Until freeze the bundle renders as a single growing page; freeze assigns
/// each visible row a permanent (page, row) slot so the dispatcher can
/// project later updates as pure edits.
pub struct ProgressBundle {
    pub id: Uuid,
    pub guild_id: u64,
    pub channel_id: u64,
    input: Option<String>,
    banner: Option<String>,
    rows: Vec<BundleRow>,
    frozen: bool,
    search_error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    page_char_limit: usize,
    /// Rows per page, fixed at freeze
    page_layout: Vec<usize>,
    pub created_at: DateTime<Utc>,
}

impl ProgressBundle {
    pub fn new(guild_id: u64, channel_id: u64, page_char_limit: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            guild_id,
            channel_id,
            input: None,
            banner: None,
            rows: Vec::new(),
            frozen: false,
            search_error: None,
            finished_at: None,
            page_char_limit,
            page_layout: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Show the initial "Processing search" banner for the raw input
    pub fn set_initial_input(&mut self, input: &str) {
        let cleaned = shorten(&input.replace(" shuffle", ""), MAX_DISPLAY_LENGTH);
        self.banner = Some(format!(
            "Processing search \"{}\"",
            suppress_embed(&cleaned)
        ));
        self.input = Some(cleaned);
    }

    /// Surface a catalog failure on the banner; the bundle is finished with
    /// zero requests
    pub fn set_search_error(&mut self, message: &str) {
        let input = self.input.clone().unwrap_or_default();
        self.banner = Some(format!(
            "Error processing search \"{}\", {message}",
            suppress_embed(&input)
        ));
        self.search_error = Some(message.to_string());
        self.frozen = true;
        self.finished_at = Some(Utc::now());
    }

    /// Replace the displayed input with a proper name from the catalog
    /// (album or playlist title)
    pub fn set_display_name(&mut self, name: &str) {
        self.input = Some(shorten(name, MAX_DISPLAY_LENGTH));
    }

    /// Append a row for a sub-request. Panics in debug builds if called
    /// after freeze.
    pub fn add_request(&mut self, request: &MediaRequest, stage: LifecycleStage) {
        debug_assert!(!self.frozen, "add_request after freeze");
        let display = shorten(&request.display(), MAX_DISPLAY_LENGTH);
        let mut row = BundleRow {
            request_id: request.id,
            display,
            stage,
            failure_reason: None,
            slot: None,
            text: String::new(),
        };
        row.text = row.render_text();
        self.rows.push(row);
    }

    /// Freeze row ordering and assign permanent page slots.
    ///
    /// Single-row bundles drop the search banner; multi-row bundles keep it
    /// as a progress line.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        self.frozen = true;

        if self.total() <= 1 {
            self.banner = None;
        } else {
            self.refresh_banner();
        }

        // Greedy pagination under the page character budget. The banner, if
        // present, occupies the first line of the first page.
        let mut layout = Vec::new();
        let mut page_chars = self.banner.as_ref().map(|b| b.len() + 1).unwrap_or(0);
        let mut rows_in_page = 0usize;
        for row in &mut self.rows {
            // Budget each slot for its longest realistic form (failure text)
            let budget = row.text.len().max(row.display.len() + 64) + 1;
            if page_chars + budget > self.page_char_limit && rows_in_page > 0 {
                layout.push(rows_in_page);
                rows_in_page = 0;
                page_chars = 0;
            }
            let page = layout.len();
            let row_in_page = rows_in_page + usize::from(page == 0 && self.banner.is_some());
            row.slot = Some((page, row_in_page));
            page_chars += budget;
            rows_in_page += 1;
        }
        if rows_in_page > 0 || layout.is_empty() {
            layout.push(rows_in_page);
        }
        self.page_layout = layout;
        self.check_finished();
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Update a row's stage in place. Counters are recomputed from scratch;
    /// frozen slots never move. Returns false when the request is unknown.
    pub fn update(
        &mut self,
        request_id: Uuid,
        stage: LifecycleStage,
        failure_reason: Option<String>,
    ) -> bool {
        let Some(row) = self.rows.iter_mut().find(|r| r.request_id == request_id) else {
            return false;
        };
        if row.stage == stage {
            return true;
        }
        row.stage = stage;
        if failure_reason.is_some() {
            row.failure_reason = failure_reason;
        }
        row.text = row.render_text();
        self.refresh_banner();
        self.check_finished();
        true
    }

    pub fn total(&self) -> usize {
        self.rows.len()
    }

    pub fn completed(&self) -> usize {
        self.count_stage(LifecycleStage::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count_stage(LifecycleStage::Failed)
    }

    pub fn discarded(&self) -> usize {
        self.count_stage(LifecycleStage::Discarded)
    }

    fn count_stage(&self, stage: LifecycleStage) -> usize {
        self.rows.iter().filter(|r| r.stage == stage).count()
    }

    /// All requests have reached a terminal stage
    pub fn all_counted(&self) -> bool {
        self.completed() + self.failed() + self.discarded() == self.total()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    fn check_finished(&mut self) {
        if self.finished_at.is_none() && self.frozen && self.all_counted() {
            self.finished_at = Some(Utc::now());
            self.refresh_banner();
        }
    }

    fn refresh_banner(&mut self) {
        if self.search_error.is_some() || self.total() <= 1 {
            return;
        }
        let Some(input) = &self.input else {
            return;
        };
        let head = if self.is_finished() && self.frozen {
            format!("Completed processing of \"{}\"", suppress_embed(input))
        } else {
            format!("Processing \"{}\"", suppress_embed(input))
        };
        let counted_total = self.total() - self.discarded();
        self.banner = Some(format!(
            "{head}\n{}/{} media requests processed, {} failed",
            self.completed(),
            counted_total,
            self.failed()
        ));
    }

    /// Render one string per page, in page order. Stable after freeze: the
    /// page count never changes and a page whose rows are all cleared
    /// renders as the empty string.
    pub fn render(&self) -> Vec<String> {
        if !self.frozen {
            // Search phase: banner only, as a single growing page
            let mut lines: Vec<&str> = Vec::new();
            if let Some(banner) = &self.banner {
                lines.push(banner);
            }
            for row in &self.rows {
                lines.push(&row.text);
            }
            let page = lines.join("\n");
            if page.is_empty() {
                return Vec::new();
            }
            return vec![page];
        }

        if let Some(error_banner) = self.search_error.as_ref().and(self.banner.as_ref()) {
            return vec![error_banner.clone()];
        }

        let mut pages = Vec::with_capacity(self.page_layout.len());
        let mut row_iter = self.rows.iter();
        for (page_index, rows_in_page) in self.page_layout.iter().enumerate() {
            let mut lines: Vec<&str> = Vec::new();
            if page_index == 0 {
                if let Some(banner) = &self.banner {
                    lines.push(banner);
                }
            }
            for _ in 0..*rows_in_page {
                if let Some(row) = row_iter.next() {
                    lines.push(&row.text);
                }
            }
            if lines.iter().all(|l| l.is_empty()) {
                pages.push(String::new());
            } else {
                pages.push(lines.join("\n"));
            }
        }
        pages
    }

    /// Slot assigned to a request's row, stable after freeze
    pub fn slot_of(&self, request_id: Uuid) -> Option<(usize, usize)> {
        self.rows
            .iter()
            .find(|r| r.request_id == request_id)
            .and_then(|r| r.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::music::request::SearchType;

    fn request(search: &str) -> MediaRequest {
        MediaRequest::new(1, 2, "tester", 3, search, SearchType::FreeText)
    }

    fn bundle_with_rows(n: usize, page_char_limit: usize) -> (ProgressBundle, Vec<Uuid>) {
        let mut bundle = ProgressBundle::new(1, 2, page_char_limit);
        bundle.set_initial_input("some album");
        let mut ids = Vec::new();
        for i in 0..n {
            let req = request(&format!("track number {i}"));
            ids.push(req.id);
            bundle.add_request(&req, LifecycleStage::Queued);
        }
        bundle.freeze();
        (bundle, ids)
    }

    #[test]
    fn test_single_row_bundle_is_one_page_without_banner() {
        let (bundle, _) = bundle_with_rows(1, 2000);
        let pages = bundle.render();
        assert_eq!(pages.len(), 1);
        assert!(!pages[0].contains("Processing"));
        assert!(pages[0].contains("track number 0"));
    }

    #[test]
    fn test_multi_row_bundle_has_progress_banner() {
        let (bundle, _) = bundle_with_rows(3, 2000);
        let pages = bundle.render();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].starts_with("Processing \"some album\""));
        assert!(pages[0].contains("0/3 media requests processed, 0 failed"));
    }

    #[test]
    fn test_slots_stable_across_updates() {
        let (mut bundle, ids) = bundle_with_rows(5, 120);
        let slots: Vec<_> = ids.iter().map(|id| bundle.slot_of(*id).unwrap()).collect();
        assert!(bundle.render().len() > 1);

        bundle.update(ids[1], LifecycleStage::InProgress, None);
        bundle.update(ids[1], LifecycleStage::Completed, None);
        bundle.update(ids[3], LifecycleStage::Failed, Some("broken".to_string()));

        let after: Vec<_> = ids.iter().map(|id| bundle.slot_of(*id).unwrap()).collect();
        assert_eq!(slots, after);
        // Page count never changes post-freeze
        assert_eq!(bundle.render().len(), bundle.render().len());
    }

    #[test]
    fn test_counter_invariant_and_finish_once() {
        let (mut bundle, ids) = bundle_with_rows(3, 2000);
        assert!(!bundle.is_finished());

        bundle.update(ids[0], LifecycleStage::Completed, None);
        assert!(bundle.completed() + bundle.failed() + bundle.discarded() <= bundle.total());
        assert!(!bundle.is_finished());

        bundle.update(ids[1], LifecycleStage::Failed, Some("nope".to_string()));
        bundle.update(ids[2], LifecycleStage::Discarded, None);
        assert!(bundle.all_counted());
        assert!(bundle.is_finished());
        let finished_at = bundle.finished_at().unwrap();

        // Further updates never reset the finish timestamp
        bundle.update(ids[2], LifecycleStage::Discarded, None);
        assert_eq!(bundle.finished_at(), Some(finished_at));
    }

    #[test]
    fn test_completed_rows_render_blank() {
        let (mut bundle, ids) = bundle_with_rows(3, 2000);
        bundle.update(ids[1], LifecycleStage::Completed, None);
        let page = &bundle.render()[0];
        let lines: Vec<&str> = page.lines().collect();
        // banner (2 lines) + 3 rows, middle row blank
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("track number 0"));
        assert_eq!(page.split('\n').nth(3), Some(""));
    }

    #[test]
    fn test_finished_banner_text() {
        let (mut bundle, ids) = bundle_with_rows(3, 2000);
        for id in &ids {
            bundle.update(*id, LifecycleStage::Completed, None);
        }
        let page = &bundle.render()[0];
        assert!(page.starts_with("Completed processing of \"some album\""));
        assert!(page.contains("3/3 media requests processed, 0 failed"));
    }

    #[test]
    fn test_render_idempotent_without_updates() {
        let (mut bundle, ids) = bundle_with_rows(4, 2000);
        bundle.update(ids[0], LifecycleStage::InProgress, None);
        let first = bundle.render();
        let second = bundle.render();
        assert_eq!(first, second);
    }

    #[test]
    fn test_search_error_renders_single_banner() {
        let mut bundle = ProgressBundle::new(1, 2, 2000);
        bundle.set_initial_input("https://open.spotify.com/album/abc");
        bundle.set_search_error("credentials seem invalid");
        bundle.freeze();

        assert!(bundle.is_finished());
        let pages = bundle.render();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].starts_with("Error processing search"));
        assert!(pages[0].contains("credentials seem invalid"));
    }

    #[test]
    fn test_shuffle_token_stripped_from_banner() {
        let mut bundle = ProgressBundle::new(1, 2, 2000);
        bundle.set_initial_input("some playlist shuffle");
        let req = request("a");
        bundle.add_request(&req, LifecycleStage::Queued);
        let page = &bundle.render()[0];
        assert!(page.contains("\"some playlist\""));
    }

    #[test]
    fn test_fully_cleared_page_renders_empty() {
        let (mut bundle, ids) = bundle_with_rows(6, 120);
        let pages = bundle.render();
        assert!(pages.len() > 1);

        // Complete every row on the last page
        let last_page = pages.len() - 1;
        for id in &ids {
            if bundle.slot_of(*id).unwrap().0 == last_page {
                bundle.update(*id, LifecycleStage::Completed, None);
            }
        }
        let pages = bundle.render();
        assert_eq!(pages[last_page], "");
        assert_eq!(pages.len(), last_page + 1);
    }
}
