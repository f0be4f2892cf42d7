use crate::scan::KeepChoice;
use crate::types::DuplicateGroup;
use humansize::{format_size, BINARY};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};

/// Asks on stderr which member of `group` to keep, reading the answer from
/// stdin.
pub fn ask_keep(
    index: usize,
    group: &DuplicateGroup,
    folder_names: &HashMap<String, String>,
) -> io::Result<KeepChoice> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stderr();
    choose_keep(index, group, folder_names, &mut input, &mut out)
}

/// Prompt loop behind [`ask_keep`]. Invalid answers re-prompt; end of input
/// skips the group.
pub fn choose_keep<R: BufRead, W: Write>(
    index: usize,
    group: &DuplicateGroup,
    folder_names: &HashMap<String, String>,
    input: &mut R,
    out: &mut W,
) -> io::Result<KeepChoice> {
    writeln!(
        out,
        "\nDuplicate group {} ({} each, {} copies):",
        index + 1,
        format_size(group.size, BINARY),
        group.files.len()
    )?;
    for (n, file) in group.files.iter().enumerate() {
        let record = group.record(&file.id).unwrap_or(file);
        let folder = record
            .first_parent()
            .and_then(|p| folder_names.get(p))
            .map(String::as_str)
            .unwrap_or("Unknown");
        writeln!(out, "  {}. {}/{} ({})", n + 1, folder, record.display_name(), record.id)?;
    }

    let mut line = String::new();
    loop {
        write!(
            out,
            "Which file number to keep (1-{}), or 's' to skip: ",
            group.files.len()
        )?;
        out.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            return Ok(KeepChoice::Skip);
        }

        let answer = line.trim();
        if answer.eq_ignore_ascii_case("s") {
            return Ok(KeepChoice::Skip);
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=group.files.len()).contains(&n) => return Ok(KeepChoice::Keep(n - 1)),
            _ => writeln!(out, "Invalid choice: {answer}")?,
        }
    }
}
