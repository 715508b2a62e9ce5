pub mod acquisition;
pub mod ban_list;
pub mod engine;
pub mod enhance;
pub mod imaging;
pub mod intake;
pub mod ocr;
pub mod pipeline;
pub mod queue;
pub mod tesseract;
pub mod variants;
pub mod vouchers;
