//! 值对象（Value Object）
//!
//! 无标识、以值相等为准的对象，用于封装不可变的概念性值。
//!
use serde::{Deserialize, Serialize};
use std::fmt;

/// 版本号（聚合乐观锁与事件单调序号）
///
/// 版本 0 表示聚合尚未持久化；每条事件使版本加一，因此事件版本总是 ≥ 1。
///
/// # 示例
///
/// ```
/// use relay_domain::value_object::Version;
///
/// let v1 = Version::new();
/// assert_eq!(v1.value(), 0);
/// assert!(v1.is_new());
///
/// let v2 = v1.next();
/// assert_eq!(v2.value(), 1);
/// assert!(v2 > v1);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(usize);

impl Version {
    /// 创建初始版本（版本号为 0）
    pub const fn new() -> Self {
        Self(0)
    }

    /// 从值创建版本号
    pub const fn from_value(value: usize) -> Self {
        Self(value)
    }

    /// 获取下一个版本号
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    /// 检查是否为初始版本
    pub const fn is_new(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for Version {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<Version> for usize {
    fn from(value: Version) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_progression_and_ordering() {
        let v0 = Version::new();
        let v3 = v0.next().next().next();
        assert!(v0.is_new());
        assert_eq!(v3.value(), 3);
        assert!(v3 > v0);
        assert_eq!(v3.to_string(), "3");
        assert_eq!(usize::from(v3), 3);
    }

    #[test]
    fn version_serializes_as_plain_number() {
        let json = serde_json::to_string(&Version::from_value(7)).unwrap();
        assert_eq!(json, "7");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Version::from_value(7));
    }
}
