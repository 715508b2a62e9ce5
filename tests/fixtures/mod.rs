//! Recognized-text fixtures modelled on real voucher photos

#![allow(dead_code)]

/// OCR output for one voucher photo and the codes that must come out of it
#[derive(Debug, Clone)]
pub struct OcrTextFixture {
    pub ocr_text: &'static str,
    pub expected_codes: &'static [&'static str],
    pub description: &'static str,
}

pub const OCR_FIXTURES: &[OcrTextFixture] = &[
    OcrTextFixture {
        ocr_text: "Your code: 1234 5678 9012 3456 enjoy",
        expected_codes: &["1234567890123456"],
        description: "single spaced code in a sentence",
    },
    OcrTextFixture {
        ocr_text: "VOUCHER\nPIN 1234 1234 1234 1234\nvalid until 2025",
        expected_codes: &[],
        description: "only the banned demo code",
    },
    OcrTextFixture {
        ocr_text: "Kode voucher\n8812 0034 5567 1290\nSerial 991 2233\n8812 0034 5567 1290",
        expected_codes: &["8812003455671290"],
        description: "code printed twice, short serial ignored",
    },
    OcrTextFixture {
        ocr_text: "4411 2233 6677 8899\n  \n5500 1122 3344 5566  \nRp 50.000",
        expected_codes: &["4411223366778899", "5500112233445566"],
        description: "two codes on separate lines with blank noise",
    },
    OcrTextFixture {
        ocr_text: "1234 5678 9012 345\n12345678901234567",
        expected_codes: &[],
        description: "15 and 17 digit runs",
    },
];
