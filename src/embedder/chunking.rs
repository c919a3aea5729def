//! Paragraph- and sentence-aware text chunking for document embedding.
//!
//! Lengths are counted in `char`s so Swedish text (å, ä, ö) is measured the
//! same way it is displayed.

const SENTENCE_ENDS: [char; 5] = ['.', '!', '?', '\n', ';'];

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Paragraphs (separated by blank lines) are packed greedily; a paragraph
/// longer than `max_chars` is cut at the last sentence boundary within the
/// second half of the window, or hard-cut when there is none.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();

        if para_len > max_chars {
            flush(&mut chunks, &mut current, &mut current_len);
            chunks.extend(split_paragraph(para, max_chars));
            continue;
        }

        let joined_len = if current_len == 0 {
            para_len
        } else {
            current_len + 2 + para_len
        };
        if joined_len > max_chars {
            flush(&mut chunks, &mut current, &mut current_len);
        }

        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    flush(&mut chunks, &mut current, &mut current_len);
    chunks
}

fn flush(chunks: &mut Vec<String>, current: &mut String, current_len: &mut usize) {
    if *current_len > 0 {
        chunks.push(std::mem::take(current));
        *current_len = 0;
    }
}

fn split_paragraph(para: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = para.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while chars.len() - start > max_chars {
        let window_end = start + max_chars;
        let earliest = start + max_chars / 2;
        let cut = (earliest..window_end)
            .rev()
            .find(|&i| SENTENCE_ENDS.contains(&chars[i]))
            .map_or(window_end, |i| i + 1);

        let piece: String = chars[start..cut].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        start = cut;
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
    }

    let rest: String = chars[start..].iter().collect();
    let rest = rest.trim();
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}
