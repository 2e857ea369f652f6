//! # fablink-agent
//!
//! 驻场代理的入口：解析命令行、起上行会话、按设备类型建下行链路，
//! 然后把主线程交给命令外壳。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use fablink_agent::cameras::{RaspistillSnapshotter, RealSenseSnapshotter};
use fablink_agent::display::FbiDisplay;
use fablink_agent::{
    AutoUpdateGate, Executor, ExecutorConfig, Shell, ShellConfig, SnapshotterSet, Uplink, VERSION,
};
use fablink_downlink::ur::MovingStateHook;
use fablink_downlink::{
    Console, Downlink, DownlinkConfig, SerialConnector, SerialDownlink, TcpUrConnector, UrDownlink,
    VirtualDownlink,
};
use fablink_protocol::config::{DEFAULT_BAUD_RATE, DEFAULT_UR_PORT, DEFAULT_UR_RTDE_PORT};

mod api_conn;
use api_conn::TcpJsonConnector;

/// RealSense 采集辅助程序的安装位置
const REALSENSE_HELPER: &str = "/opt/fablink/realsense-snapshot";

/// raspistill 在场即接入快照扇出
const RASPISTILL_BIN: &str = "/usr/bin/raspistill";

/// fablink 驻场代理：桥接云端任务服务与本地制造设备
#[derive(Parser, Debug)]
#[command(name = "fablink-agent", version = VERSION)]
struct Cli {
    /// API 服务器地址
    #[arg(long = "api_server", default_value = "api.fablink.io:7878")]
    api_server: String,

    /// 串口波特率
    #[arg(long = "rate", default_value_t = DEFAULT_BAUD_RATE)]
    rate: u32,

    /// 设备类型：usb-gcode 或 ur3
    #[arg(long = "device_type", default_value = "usb-gcode")]
    device_type: String,

    /// UR3 机械臂主机名
    #[arg(long = "ur3_host", default_value = "")]
    ur3_host: String,

    /// URScript 命令口
    #[arg(long = "ur3_port", default_value_t = DEFAULT_UR_PORT)]
    ur3_port: u16,

    /// RTDE 订阅口
    #[arg(long = "ur3_rtde_port", default_value_t = DEFAULT_UR_RTDE_PORT)]
    ur3_rtde_port: u16,

    /// 不连真实设备，虚拟执行
    #[arg(long = "virtual")]
    virtual_device: bool,

    /// 启用 RealSense 深度相机
    #[arg(long = "realsense")]
    realsense: bool,

    /// 虚拟执行时 G4 驻留的加速倍数
    #[arg(long = "speedup", default_value_t = 1.0)]
    speedup: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    info!("fablink agent version: {VERSION}");

    // 上行会话循环在自己的线程上跑一辈子
    let up = Uplink::new();
    {
        let up = up.clone();
        let connector = Arc::new(TcpJsonConnector::new(cli.api_server.clone()));
        thread::Builder::new()
            .name("uplink-session".into())
            .spawn(move || up.run_session_loop(connector))?;
    }

    let console: Arc<dyn Console> = up.clone();
    let down: Arc<dyn Downlink> = if cli.virtual_device {
        Arc::new(VirtualDownlink::new(console, cli.speedup))
    } else {
        match cli.device_type.as_str() {
            "usb-gcode" => {
                let connector = Arc::new(SerialConnector::new(console.clone(), cli.rate));
                SerialDownlink::spawn(console, connector, DownlinkConfig::default())
            },
            "ur3" => {
                if cli.ur3_host.is_empty() {
                    bail!("--ur3_host is required for the ur3 device type");
                }
                let connector = Arc::new(TcpUrConnector::new(
                    console.clone(),
                    cli.ur3_host.clone(),
                    cli.ur3_port,
                    cli.ur3_rtde_port,
                ));
                let hook_up = up.clone();
                let hook: MovingStateHook = Box::new(move |state, vec| {
                    hook_up.notify_moving_state(state, vec.to_vec());
                });
                UrDownlink::spawn(console, connector, hook, DownlinkConfig::default())
            },
            other => bail!("unknown device type {other:?}"),
        }
    };

    let mut cameras = SnapshotterSet::new();
    if cli.realsense {
        cameras.insert(
            "realsense",
            RealSenseSnapshotter::new(up.clone(), PathBuf::from(REALSENSE_HELPER)),
        );
    }
    if Path::new(RASPISTILL_BIN).exists() {
        cameras.insert("raspistill", RaspistillSnapshotter::new(up.clone()));
    }

    let mut exe = Executor::new(
        up.clone(),
        down,
        AutoUpdateGate::new(),
        ExecutorConfig::default(),
    )
    .with_cameras(cameras);
    if !cli.virtual_device {
        exe = exe.with_display(Arc::new(FbiDisplay));
    }

    let shell = Shell::new(up, Arc::new(exe), ShellConfig::default());
    shell.run();
    Ok(())
}
