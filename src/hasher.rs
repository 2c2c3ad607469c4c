// Safekeep - 文件内容指纹模块
// 启用内容检查时，用 XXH3 判断大小和修改时间都相同的两个文件是否真的一致

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use xxhash_rust::xxh3::Xxh3;

/// 计算文件内容的 XXH3 哈希值
///
/// 使用 1MB 的读缓冲和 64KB 的哈希块。XXH3 不是加密哈希，只用于比对。
pub fn calculate_hash(path: &Path) -> std::io::Result<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Xxh3::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hasher.digest())
}

/// 比较两个文件的内容
///
/// 任意一侧读取失败都视为不同，由调用方重新复制。
pub fn same_content(a: &Path, b: &Path) -> bool {
    match (calculate_hash(a), calculate_hash(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn equal_bytes_hash_equal() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        fs::write(&a, b"level-01 layout").unwrap();
        fs::write(&b, b"level-01 layout").unwrap();
        fs::write(&c, b"level-02 layout").unwrap();

        assert!(same_content(&a, &b));
        assert!(!same_content(&a, &c));
        assert!(!same_content(&a, &dir.path().join("missing")));
    }
}
