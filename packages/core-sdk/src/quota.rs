//! 图像生成的每日计数（客户端）。
//!
//! 仅作为界面提示：状态完全保存在客户端，删除文件即可重置，中继端不做任何限制。

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, Duration, OffsetDateTime};

pub const DAILY_LIMIT: u32 = 10;
/** \brief 首次锁定时长，以及每次锁定期间再尝试时追加的时长（小时）。 */
pub const BLOCK_HOURS: i64 = 12;
pub const DEFAULT_UNLOCK_SECRET: &str = "unlock-chatrelay";

/**
 * \brief 本地持久化的计数状态。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationQuota {
    /** \brief 计数对应的日期 YYYY-MM-DD */
    pub date: String,
    pub count: u32,
    pub unlimited: bool,
    /** \brief 锁定截止时间（Unix 毫秒） */
    #[serde(default)]
    pub block_until: Option<i64>,
    /** \brief 当前锁定时长（小时） */
    pub block_duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /** \brief `remaining` 为 None 表示无限模式。 */
    Allowed { remaining: Option<u32> },
    /** \brief `extended` 表示本次尝试延长了锁定。 */
    Locked { until_ms: i64, extended: bool },
}

fn day_key(now: OffsetDateTime) -> String {
    now.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default()
}

fn unix_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

impl GenerationQuota {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            date: day_key(now),
            count: 0,
            unlimited: false,
            block_until: None,
            block_duration: BLOCK_HOURS,
        }
    }

    /**
     * \brief 跨天清零计数；锁定已过期则解除并复位锁定时长。无限模式保留。
     */
    pub fn refresh(&mut self, now: OffsetDateTime) {
        let today = day_key(now);
        if self.date != today {
            self.date = today;
            self.count = 0;
        }
        if matches!(self.block_until, Some(until) if until < unix_ms(now)) {
            self.block_until = None;
            self.block_duration = BLOCK_HOURS;
        }
    }

    /**
     * \brief 生成前检查。已达上限时每次尝试都会把锁定时长再延长 12 小时。
     */
    pub fn check(&mut self, now: OffsetDateTime) -> QuotaDecision {
        self.refresh(now);
        if self.unlimited {
            return QuotaDecision::Allowed { remaining: None };
        }
        let now_ms = unix_ms(now);
        if let Some(until) = self.block_until.filter(|until| *until > now_ms) {
            return QuotaDecision::Locked {
                until_ms: until,
                extended: false,
            };
        }
        if self.count >= DAILY_LIMIT {
            self.block_duration += BLOCK_HOURS;
            let until = unix_ms(now + Duration::hours(self.block_duration));
            self.block_until = Some(until);
            return QuotaDecision::Locked {
                until_ms: until,
                extended: true,
            };
        }
        QuotaDecision::Allowed {
            remaining: Some(DAILY_LIMIT - self.count),
        }
    }

    /** \brief 记录成功生成的张数；首次达到上限时开始 12 小时锁定。 */
    pub fn record(&mut self, images: u32, now: OffsetDateTime) {
        if self.unlimited {
            return;
        }
        self.refresh(now);
        self.count += images;
        if self.count >= DAILY_LIMIT && self.block_until.is_none() {
            self.block_duration = BLOCK_HOURS;
            self.block_until = Some(unix_ms(now + Duration::hours(BLOCK_HOURS)));
        }
    }

    /** \brief 口令正确则进入无限模式并解除锁定。 */
    pub fn unlock(&mut self, attempt: &str, secret: &str) -> bool {
        if attempt != secret {
            return false;
        }
        self.unlimited = true;
        self.block_until = None;
        true
    }

    pub fn load(path: &Path, now: OffsetDateTime) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(now));
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read quota file {}", path.display()))?;
        let mut quota: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse quota file {}", path.display()))?;
        quota.refresh(now);
        Ok(quota)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("write quota file {}", path.display()))
    }
}

/**
 * \brief 剩余锁定时间的可读描述，如 "11 hours and 5 minutes"。
 */
pub fn format_remaining(until_ms: i64, now: OffsetDateTime) -> String {
    let diff = until_ms - unix_ms(now);
    if diff <= 0 {
        return "unlocked".to_string();
    }
    let hours = diff / (1000 * 60 * 60);
    let minutes = (diff % (1000 * 60 * 60)) / (1000 * 60);
    format!(
        "{} hour{} and {} minute{}",
        hours,
        if hours == 1 { "" } else { "s" },
        minutes,
        if minutes == 1 { "" } else { "s" }
    )
}
