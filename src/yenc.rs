//! yEnc article codec
//!
//! Decoding is done by `nntp-rs`; this module finds the payload inside a raw
//! article body and maps the result onto the file it belongs to. Multi-part
//! posts carry an `=ypart` line whose `begin=` gives the 1-based offset of the
//! fragment inside the target file.
//!
//! Part CRCs in the trailer are not checked. Completed files are verified as a
//! whole against the SFV checksum manifest instead.

use crate::error::DecodeError;

/// Encoded line length used by [`encode_part`]
const LINE_LENGTH: usize = 128;

const BEGIN_MARKER: &[u8] = b"=ybegin ";

/// One decoded article: where its bytes go and the bytes themselves
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedArticle {
    /// Target file name from the `name=` tag
    pub file_name: String,
    /// 0-based byte offset of `data` inside the target file
    pub offset: u64,
    /// Decoded payload
    pub data: Vec<u8>,
    /// `part=` from the header, for multi-part posts
    pub part: Option<u32>,
    /// `total=` from the header, for multi-part posts
    pub total_parts: Option<u32>,
    /// `size=` from the header: the size of the whole target file
    pub file_size: Option<u64>,
}

/// Decode a raw article body (CRLF or LF separated lines)
///
/// Lines before `=ybegin` (article headers, text) are skipped. Without an
/// `=ybegin` line the article has no payload.
pub fn decode_article(body: &[u8]) -> Result<DecodedArticle, DecodeError> {
    let start = payload_start(body).ok_or(DecodeError::NoPayload)?;
    let payload = &body[start..];

    let decoded =
        nntp_rs::yenc_decode(payload).map_err(|e| DecodeError::InvalidHeader(e.to_string()))?;

    let offset = match &decoded.part {
        Some(part) => part.begin.checked_sub(1).ok_or_else(|| {
            DecodeError::InvalidHeader(format!("begin={} in =ypart", part.begin))
        })?,
        None => 0,
    };

    // nntp-rs stops name= at the first space; the name runs to the end of the line
    let file_name = full_name(payload).unwrap_or(decoded.header.name);

    Ok(DecodedArticle {
        file_name,
        offset,
        part: decoded.header.part,
        total_parts: decoded.header.total,
        file_size: Some(decoded.header.size).filter(|&size| size > 0),
        data: decoded.data,
    })
}

/// Encode one part of a file as a complete article body.
///
/// `offset` is the 0-based position of `data` inside a file of `file_size`
/// bytes. This is the inverse of [`decode_article`] and is mostly useful for
/// building fixtures.
pub fn encode_part(
    file_name: &str,
    data: &[u8],
    offset: u64,
    file_size: u64,
    part: u32,
    total_parts: u32,
) -> Result<Vec<u8>, nntp_rs::NntpError> {
    let begin = offset + 1;
    let end = offset + data.len() as u64;
    nntp_rs::yenc_encode(
        data,
        file_name,
        LINE_LENGTH,
        Some((part, total_parts, begin, end, file_size)),
    )
}

/// Byte index of the `=ybegin` line
fn payload_start(body: &[u8]) -> Option<usize> {
    if body.starts_with(BEGIN_MARKER) {
        return Some(0);
    }
    body.windows(BEGIN_MARKER.len() + 1)
        .position(|w| w[0] == b'\n' && &w[1..] == BEGIN_MARKER)
        .map(|i| i + 1)
}

fn full_name(payload: &[u8]) -> Option<String> {
    let line_end = payload
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(payload.len());
    let line = String::from_utf8_lossy(&payload[..line_end]);
    line.find(" name=")
        .map(|idx| line[idx + 6..].trim().to_string())
        .filter(|name| !name.is_empty())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(len: usize) -> Vec<u8> {
        // Covers every byte value, including the ones that need escaping
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn single_part_article_after_headers() {
        let body = b"Path: news\r\nSubject: test\r\n\r\n=ybegin line=128 size=2 name=hello world.bin\r\nkl\r\n=yend size=2\r\n";

        let article = decode_article(body).unwrap();

        assert_eq!(article.file_name, "hello world.bin");
        assert_eq!(article.offset, 0);
        assert_eq!(article.data, vec![b'A', b'B']);
        assert_eq!(article.file_size, Some(2));
        assert_eq!(article.part, None);
    }

    #[test]
    fn part_line_sets_zero_based_offset() {
        let body = b"=ybegin part=2 total=3 line=128 size=300 name=a.rar\n=ypart begin=101 end=200\nkkkk\n=yend size=4 part=2 pcrc32=ffffffff\n";

        let article = decode_article(body).unwrap();

        assert_eq!(article.offset, 100);
        assert_eq!(article.part, Some(2));
        assert_eq!(article.total_parts, Some(3));
        assert_eq!(article.file_size, Some(300));
        // The wrong pcrc32 is not enforced
        assert_eq!(article.data, b"AAAA");
    }

    #[test]
    fn article_without_begin_has_no_payload() {
        let body = b"Subject: nothing here\r\n\r\njust text\r\n";
        assert_eq!(decode_article(body), Err(DecodeError::NoPayload));
        assert_eq!(decode_article(b""), Err(DecodeError::NoPayload));
    }

    #[test]
    fn begin_zero_is_invalid() {
        let body = b"=ybegin part=1 total=1 line=128 size=1 name=x\n=ypart begin=0 end=1\nk\n=yend size=1\n";
        assert!(matches!(
            decode_article(body),
            Err(DecodeError::InvalidHeader(_))
        ));
    }

    #[test]
    fn missing_trailer_is_invalid() {
        let body = b"=ybegin line=128 size=1 name=x\nk\n";
        assert!(matches!(
            decode_article(body),
            Err(DecodeError::InvalidHeader(_))
        ));
    }

    #[test]
    fn parts_reassemble_into_the_original_file() {
        let original = sample_bytes(10_000);
        let chunk = 3_000;
        let total_parts = original.len().div_ceil(chunk) as u32;

        let mut rebuilt = vec![0u8; original.len()];
        for (i, piece) in original.chunks(chunk).enumerate() {
            let offset = (i * chunk) as u64;
            let body = encode_part(
                "movie.part01.rar",
                piece,
                offset,
                original.len() as u64,
                i as u32 + 1,
                total_parts,
            )
            .unwrap();
            let article = decode_article(&body).unwrap();
            assert_eq!(article.offset, offset);
            assert_eq!(article.file_name, "movie.part01.rar");
            let start = article.offset as usize;
            rebuilt[start..start + article.data.len()].copy_from_slice(&article.data);
        }

        assert_eq!(rebuilt, original);
    }
}
