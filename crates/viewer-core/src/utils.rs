//! 通用工具函数

use chrono::Utc;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    format!("{}.{}.{}",
        "1.2.826.0.1.3680043.9.7382", // 企业根标识符
        Uuid::new_v4().as_u128() % 1_000_000_000_000,
        Utc::now().timestamp(),
    )
}

/// 为一个序列生成堆栈影像ID (`wadors:` 前缀，与查看器加载器一致)
pub fn stack_image_ids(series_uid: &str, count: usize) -> Vec<String> {
    (1..=count)
        .map(|n| format!("wadors:{}/instances/{}", series_uid, n))
        .collect()
}

// 锁被毒化时仍然取出数据：视口协调属于尽力而为的逻辑，不能因为
// 某个回调panic而让整个查看器不可用。

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(uid.len() <= 64);
        assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
        assert_ne!(uid, generate_dicom_uid());
    }

    #[test]
    fn test_stack_image_ids() {
        let ids = stack_image_ids("1.2.3", 3);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "wadors:1.2.3/instances/1");
        assert_eq!(ids[2], "wadors:1.2.3/instances/3");
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }
}
