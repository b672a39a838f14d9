pub fn size_to_str(size: u64) -> String {
    if size > 1024 * 1024 * 1024 {
        format!("{} GiB ({} bytes)", size / (1024 * 1024 * 1024), size)
    } else if size > 1024 * 1024 {
        format!("{} MiB ({} bytes)", size / (1024 * 1024), size)
    } else if size > 1024 {
        format!("{} KiB ({} bytes)", size / 1024, size)
    } else {
        format!("{} bytes", size)
    }
}
