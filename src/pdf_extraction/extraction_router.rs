// Extraction router - ordered fallback chain over the calendar PDF
//
// Strategies run text -> color -> OCR. Each one only sees the days that are
// still pending, and a day leaves the pending set the moment any strategy
// resolves it, so later (less trusted) stages can never overwrite it.
use lopdf::content::Operation;
use lopdf::{Document, ObjectId};
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, info, warn};

use super::calendar_table::{locate_table, CalendarTable, KeywordMatcher};
use super::color::{sample_cell, ColorClassifier, PixelRect};
use super::lopdf_helper::{load_pdf, page_ids, page_operations};
use super::ocr_engine::{locate_status_cells, OcrError, TesseractRecognizer, TextRecognizer};
use super::raster::{render_page, PageRaster};
use super::text_layer::{collect_text_runs, TextRun};
use crate::config::{ExtractionConfig, GridCrop};
use crate::types::{
    weekday_label, AvailabilityStatus, CalendarDate, DateRange, ExtractionError, ExtractionMethod,
    ExtractionResult, SkippedMethod, TargetMonth,
};

/// What to extract: a month and the range of its days.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub range: DateRange,
    pub month: TargetMonth,
    /// Only used to label weekdays when the table prints none.
    pub year: Option<i32>,
}

impl ExtractionRequest {
    pub fn new(range: DateRange, month: TargetMonth) -> Self {
        Self { range, month, year: None }
    }

    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.year = year;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// The method cannot run in this environment; the chain moves on.
    #[error("{0}")]
    Unavailable(String),
}

impl From<OcrError> for StrategyError {
    fn from(err: OcrError) -> Self {
        StrategyError::Unavailable(err.to_string())
    }
}

impl From<ExtractionError> for StrategyError {
    fn from(err: ExtractionError) -> Self {
        StrategyError::Unavailable(err.to_string())
    }
}

/// One stage of the fallback chain.
pub trait ExtractionStrategy: Send + Sync {
    fn method(&self) -> ExtractionMethod;

    /// Statuses for any of `pending` this stage can decide. Days it cannot
    /// decide are simply left out.
    fn resolve(
        &self,
        context: &ExtractionContext,
        pending: &[u32],
    ) -> Result<BTreeMap<u32, AvailabilityStatus>, StrategyError>;
}

struct PageContent {
    id: ObjectId,
    operations: Vec<Operation>,
    runs: Vec<TextRun>,
}

/// Parsed document shared by every stage of one extraction.
///
/// The calendar table and page rasters are computed on first use, so a PDF
/// whose text layer answers everything is never rendered.
pub struct ExtractionContext<'r> {
    document: Document,
    pages: Vec<PageContent>,
    request: &'r ExtractionRequest,
    table: OnceCell<Option<CalendarTable>>,
    rasters: RefCell<HashMap<(usize, u32), Rc<PageRaster>>>,
}

impl<'r> ExtractionContext<'r> {
    pub fn new(document: Document, request: &'r ExtractionRequest) -> Result<Self, ExtractionError> {
        let mut pages = Vec::new();
        for id in page_ids(&document) {
            let operations = page_operations(&document, id)?;
            let runs = collect_text_runs(&operations);
            pages.push(PageContent { id, operations, runs });
        }
        debug!(pages = pages.len(), "decoded page content");

        Ok(Self {
            document,
            pages,
            request,
            table: OnceCell::new(),
            rasters: RefCell::new(HashMap::new()),
        })
    }

    pub fn request(&self) -> &ExtractionRequest {
        self.request
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// The target month's table from the first page that has one.
    pub fn table(&self) -> Option<&CalendarTable> {
        self.table
            .get_or_init(|| {
                let found = self
                    .pages
                    .iter()
                    .enumerate()
                    .find_map(|(index, page)| locate_table(&page.runs, &self.request.month, index));
                match &found {
                    Some(table) => debug!(page = table.page, header = %table.header, "located calendar table"),
                    None => debug!(month = self.request.month.name(), "no calendar table in the text layer"),
                }
                found
            })
            .as_ref()
    }

    /// Page `index` rendered at `dpi`, cached per resolution.
    pub fn raster(&self, index: usize, dpi: f32) -> Result<Rc<PageRaster>, ExtractionError> {
        let key = (index, dpi.to_bits());
        if let Some(raster) = self.rasters.borrow().get(&key) {
            return Ok(Rc::clone(raster));
        }

        let page = self.pages.get(index).ok_or_else(|| {
            ExtractionError::InvalidRequest(format!("page {} out of range ({} pages)", index, self.pages.len()))
        })?;
        let raster = Rc::new(render_page(&self.document, page.id, &page.operations, dpi)?);
        debug!(page = index, dpi, width = raster.width(), height = raster.height(), "rendered page");
        self.rasters.borrow_mut().insert(key, Rc::clone(&raster));
        Ok(raster)
    }
}

/// Classify cells by the status text printed in them.
pub struct TextStrategy {
    matcher: KeywordMatcher,
}

impl TextStrategy {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self { matcher: KeywordMatcher::new(&config.keywords) }
    }
}

impl ExtractionStrategy for TextStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Text
    }

    fn resolve(
        &self,
        context: &ExtractionContext,
        pending: &[u32],
    ) -> Result<BTreeMap<u32, AvailabilityStatus>, StrategyError> {
        let mut found = BTreeMap::new();
        let Some(table) = context.table() else {
            return Ok(found);
        };

        for &day in pending {
            let text = table.columns.get(&day).and_then(|c| c.status_text.as_deref());
            match text.map(|t| (t, self.matcher.classify(t))) {
                Some((_, Some(status))) => {
                    debug!(day, %status, "text cell matched");
                    found.insert(day, status);
                }
                Some((t, None)) => debug!(day, text = t, "cell text matches no keyword"),
                None => {}
            }
        }
        Ok(found)
    }
}

/// Shared sampling settings of the color and OCR stages.
#[derive(Debug, Clone)]
struct Sampler {
    classifier: ColorClassifier,
    inset: f32,
    min_coverage: f32,
}

impl Sampler {
    fn new(config: &ExtractionConfig) -> Self {
        Self {
            classifier: ColorClassifier::new(&config.colors),
            inset: config.sample_inset,
            min_coverage: config.min_coverage,
        }
    }

    fn classify(&self, raster: &PageRaster, day: u32, cell: PixelRect) -> Option<AvailabilityStatus> {
        let Some(sample) = sample_cell(&raster.image, &raster.coverage, cell, self.inset, self.min_coverage) else {
            debug!(day, "cell is mostly bare page, no evidence");
            return None;
        };
        let status = self.classifier.classify(sample.color);
        debug!(day, color = ?sample.color, coverage = sample.coverage, %status, "sampled cell");
        status.is_resolved().then_some(status)
    }
}

/// Sample fill colors at the cells of the located table, or at a fixed grid.
pub struct ColorStrategy {
    sampler: Sampler,
    dpi: f32,
    grid: Option<GridCrop>,
}

impl ColorStrategy {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            sampler: Sampler::new(config),
            dpi: config.render_dpi,
            grid: config.grid.clone(),
        }
    }

    fn grid_cells(grid: &GridCrop, raster: &PageRaster, pending: &[u32]) -> Vec<(u32, PixelRect)> {
        let pitch = grid.row_pitch.unwrap_or(grid.cell_height);
        let columns = grid.columns.max(1);
        pending
            .iter()
            .filter(|&&day| day >= grid.first_day)
            .filter_map(|&day| {
                let index = day - grid.first_day;
                let x = grid.x + (index % columns) as f32 * grid.cell_width;
                let y = grid.y + (index / columns) as f32 * pitch;
                raster
                    .top_left_rect(x, y, grid.cell_width, grid.cell_height)
                    .map(|cell| (day, cell))
            })
            .collect()
    }
}

impl ExtractionStrategy for ColorStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Color
    }

    fn resolve(
        &self,
        context: &ExtractionContext,
        pending: &[u32],
    ) -> Result<BTreeMap<u32, AvailabilityStatus>, StrategyError> {
        let (raster, cells) = if let Some(grid) = &self.grid {
            let raster = context.raster(grid.page, self.dpi)?;
            let cells = Self::grid_cells(grid, &raster, pending);
            (raster, cells)
        } else if let Some(table) = context.table() {
            let raster = context.raster(table.page, self.dpi)?;
            let cells: Vec<(u32, PixelRect)> = pending
                .iter()
                .filter_map(|&day| table.status_cell(day).and_then(|rect| raster.pdf_rect(rect)).map(|c| (day, c)))
                .collect();
            (raster, cells)
        } else {
            debug!("no table and no grid configured, nothing to sample");
            return Ok(BTreeMap::new());
        };

        Ok(cells
            .into_iter()
            .filter_map(|(day, cell)| self.sampler.classify(&raster, day, cell).map(|s| (day, s)))
            .collect())
    }
}

/// Recover the date grid from recognized words, then sample colors there.
pub struct OcrStrategy<R> {
    recognizer: R,
    sampler: Sampler,
    dpi: f32,
    status_row_offset: f32,
}

impl<R: TextRecognizer> OcrStrategy<R> {
    pub fn new(recognizer: R, config: &ExtractionConfig) -> Self {
        Self {
            recognizer,
            sampler: Sampler::new(config),
            dpi: config.ocr.dpi,
            status_row_offset: config.ocr.status_row_offset,
        }
    }
}

impl<R: TextRecognizer + Send + Sync> ExtractionStrategy for OcrStrategy<R> {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Ocr
    }

    fn resolve(
        &self,
        context: &ExtractionContext,
        pending: &[u32],
    ) -> Result<BTreeMap<u32, AvailabilityStatus>, StrategyError> {
        let month = &context.request().month;

        for page in 0..context.page_count() {
            let raster = context.raster(page, self.dpi)?;
            let words = self.recognizer.recognize(&raster.image)?;
            let cells = locate_status_cells(&words, month, self.status_row_offset);
            if cells.is_empty() {
                continue;
            }

            let (width, height) = (raster.width(), raster.height());
            return Ok(pending
                .iter()
                .filter_map(|&day| {
                    let (x0, y0, x1, y1) = *cells.get(&day)?;
                    let cell = PixelRect::clipped(x0, y0, x1, y1, width, height)?;
                    self.sampler.classify(&raster, day, cell).map(|s| (day, s))
                })
                .collect());
        }
        debug!("OCR found no date row on any page");
        Ok(BTreeMap::new())
    }
}

/// The Availability Extractor: runs the strategy chain over PDF bytes.
pub struct AvailabilityExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl AvailabilityExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        let mut strategies: Vec<Box<dyn ExtractionStrategy>> = vec![
            Box::new(TextStrategy::new(config)),
            Box::new(ColorStrategy::new(config)),
        ];
        if config.ocr.enabled {
            let recognizer = TesseractRecognizer::new(&config.ocr);
            strategies.push(Box::new(OcrStrategy::new(recognizer, config)));
        }
        Self::with_strategies(strategies)
    }

    /// Custom chain, applied in order.
    pub fn with_strategies(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, pdf_bytes: &[u8], request: &ExtractionRequest) -> Result<ExtractionResult, ExtractionError> {
        let document = load_pdf(pdf_bytes)?;
        let context = ExtractionContext::new(document, request)?;
        let month = request.month.number();

        let mut dates: BTreeMap<u32, CalendarDate> = request
            .range
            .days()
            .map(|day| (day, CalendarDate::unresolved(request.year, month, day)))
            .collect();
        let mut skipped = Vec::new();

        for strategy in &self.strategies {
            let pending: Vec<u32> = dates
                .values()
                .filter(|date| !date.status.is_resolved())
                .map(|date| date.day)
                .collect();
            if pending.is_empty() {
                break;
            }

            let method = strategy.method();
            match strategy.resolve(&context, &pending) {
                Ok(found) => {
                    let mut resolved = 0;
                    for (day, status) in found {
                        let Some(date) = dates.get_mut(&day) else {
                            continue;
                        };
                        if date.status.is_resolved() || !status.is_resolved() {
                            continue;
                        }
                        date.status = status;
                        date.method = Some(method);
                        resolved += 1;
                    }
                    debug!(%method, pending = pending.len(), resolved, "strategy finished");
                }
                Err(StrategyError::Unavailable(reason)) => {
                    warn!(%method, %reason, "extraction method unavailable, skipping");
                    skipped.push(SkippedMethod { method, reason });
                }
            }
        }

        let table = context.table();
        for date in dates.values_mut() {
            date.weekday = table
                .and_then(|t| t.columns.get(&date.day))
                .and_then(|c| c.weekday.clone())
                .or_else(|| weekday_label(request.year, month, date.day));
        }

        let result = ExtractionResult {
            month,
            year: request.year,
            range: request.range,
            dates: dates.into_values().collect(),
            skipped,
        };
        info!(
            month = request.month.name(),
            range = %request.range,
            available = result.available_dates().len(),
            unknown = result.unknown_dates().len(),
            confidence = ?result.confidence(),
            "extraction complete"
        );
        Ok(result)
    }
}

/// Extract `range` of `month` with the default configuration.
pub fn extract(pdf_bytes: &[u8], range: DateRange, month: TargetMonth) -> Result<ExtractionResult, ExtractionError> {
    AvailabilityExtractor::new(&ExtractionConfig::default()).extract(pdf_bytes, &ExtractionRequest::new(range, month))
}
