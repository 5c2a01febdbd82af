// PDF extraction module
pub mod calendar_table;
pub mod color;
pub mod extraction_router;
pub mod lopdf_helper;
pub mod ocr_engine;
pub mod raster;
pub mod text_layer;

pub use extraction_router::{
    extract, AvailabilityExtractor, ColorStrategy, ExtractionContext, ExtractionRequest,
    ExtractionStrategy, OcrStrategy, StrategyError, TextStrategy,
};
pub use ocr_engine::{OcrError, OcrWord, TesseractRecognizer, TextRecognizer};
