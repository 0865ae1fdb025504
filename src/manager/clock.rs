//! 时钟触发匹配
//!
//! - `times`：本地时间的 `HH:MM` 命中列表中任一项，且星期命中 `days`（空或 `*` 表示每天）；
//!   同一分钟内只触发一次（以 `last_run` 去重）
//! - `interval`：距 `last_run` 不少于 `every`；从未运行过则立即触发
//! - `daemon`：Robot 有空闲配额即触发
//!
//! 全部按 Robot 配置的时区计算，缺省 UTC。

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::core::error::Result;
use crate::robot::{ClockConfig, ClockMode, Robot};

pub use crate::robot::config::parse_duration;

fn parse_times(clock: &ClockConfig) -> Vec<NaiveTime> {
    clock
        .times
        .iter()
        .filter_map(|t| NaiveTime::parse_from_str(t.trim(), "%H:%M").ok())
        .collect()
}

fn day_matches(clock: &ClockConfig, weekday: Weekday) -> bool {
    if clock.days.is_empty() || clock.days.iter().any(|d| d.trim() == "*") {
        return true;
    }
    clock
        .days
        .iter()
        .filter_map(|d| d.trim().parse::<Weekday>().ok())
        .any(|d| d == weekday)
}

fn same_minute(a: DateTime<Tz>, b: DateTime<Tz>) -> bool {
    a.date_naive() == b.date_naive() && a.hour() == b.hour() && a.minute() == b.minute()
}

/// 按时钟计划判断此刻是否触发。未配置计划、时钟触发被关闭、状态为 paused / error / maintenance 时一律不触发
pub fn should_trigger(robot: &Robot, now: DateTime<Utc>) -> Result<bool> {
    let config = robot.config();
    let Some(clock) = config.clock.as_ref() else {
        return Ok(false);
    };
    if !config.triggers.clock || robot.status().blocks_clock() {
        return Ok(false);
    }
    let tz = clock.timezone()?;

    let fire = match clock.mode {
        ClockMode::Times => {
            let local = now.with_timezone(&tz);
            let hit = day_matches(clock, local.weekday())
                && parse_times(clock)
                    .iter()
                    .any(|t| t.hour() == local.hour() && t.minute() == local.minute());
            let already = robot
                .last_run()
                .map(|last| same_minute(last.with_timezone(&tz), local))
                .unwrap_or(false);
            hit && !already
        }
        ClockMode::Interval => {
            let every = parse_duration(clock.every.as_deref().unwrap_or_default())?;
            match robot.last_run() {
                None => true,
                Some(last) => now - last >= every,
            }
        }
        ClockMode::Daemon => robot.can_run(),
    };
    Ok(fire)
}

/// 计算下一次计划运行时间（daemon 模式没有固定时间，返回 None）
pub fn next_run(clock: &ClockConfig, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz = clock.timezone().ok()?;
    match clock.mode {
        ClockMode::Interval => {
            let every = parse_duration(clock.every.as_deref()?).ok()?;
            let due = match last_run {
                Some(last) => last.checked_add_signed(every)?,
                None => now,
            };
            Some(due.max(now))
        }
        ClockMode::Times => {
            let times = parse_times(clock);
            let local_now = now.with_timezone(&tz);
            // 最多向后看一周
            (0..8)
                .flat_map(|offset| {
                    let day = local_now.date_naive() + Duration::days(offset);
                    times.iter().filter_map(move |t| {
                        day.and_time(*t).and_local_timezone(tz).earliest()
                    })
                })
                .filter(|candidate| *candidate > local_now && day_matches(clock, candidate.weekday()))
                .min()
                .map(|t| t.with_timezone(&Utc))
        }
        ClockMode::Daemon => None,
    }
}
