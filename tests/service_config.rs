use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use waste_vision::config::ServiceConfig;
use waste_vision::BackendKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VISION_CONFIG",
        "VISION_ADDR",
        "VISION_ALLOWED_ORIGIN",
        "VISION_DEFAULT_MODEL",
        "VISION_YOLO11_MODEL",
        "VISION_RTDETR_MODEL",
        "VISION_FASTER_RCNN_MODEL",
        "VISION_MAX_REQUEST_BYTES",
        "VISION_MAX_CONNECTIONS",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServiceConfig::load().expect("load defaults");
    assert_eq!(cfg.addr, "127.0.0.1:8000");
    assert_eq!(cfg.allowed_origin, "http://localhost:8080");
    assert_eq!(cfg.max_request_bytes, 16 * 1024 * 1024);
    assert_eq!(cfg.max_connections, 32);
    assert_eq!(cfg.crop_quality, 95);
    assert_eq!(cfg.default_model, "yolo11");
    assert_eq!(cfg.yolo11.path, PathBuf::from("model/yolo11l_finetune.onnx"));
    assert_eq!(cfg.rt_detr.path, PathBuf::from("model/rt_detr_finetune.onnx"));
    assert_eq!(cfg.faster_rcnn.path, PathBuf::from("model/faster_rcnn.onnx"));
    assert_eq!(cfg.yolo11.detector.confidence, 0.5);
    assert_eq!(cfg.rt_detr.detector.input_size, 640);
    assert_eq!(cfg.faster_rcnn.detector.min_size, 800);
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
addr = "0.0.0.0:9000"
crop_quality = 80
default_model = "rt-detr"

[models.yolo11]
path = "weights/yolo.onnx"
confidence = 0.35
iou = 0.6

[models.rt-detr]
labels = "weights/labels.txt"
input_size = 512

[models.faster-rcnn]
enabled = false
"#,
    );
    std::env::set_var("VISION_CONFIG", file.path());
    std::env::set_var("VISION_ALLOWED_ORIGIN", "https://bins.example");
    std::env::set_var("VISION_RTDETR_MODEL", "/srv/rtdetr.onnx");
    std::env::set_var("VISION_MAX_REQUEST_BYTES", "1048576");
    std::env::set_var("VISION_MAX_CONNECTIONS", "4");

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.addr, "0.0.0.0:9000");
    assert_eq!(cfg.allowed_origin, "https://bins.example");
    assert_eq!(cfg.crop_quality, 80);
    assert_eq!(cfg.default_model, "rt-detr");
    assert_eq!(cfg.max_request_bytes, 1_048_576);
    assert_eq!(cfg.max_connections, 4);
    assert_eq!(cfg.yolo11.path, PathBuf::from("weights/yolo.onnx"));
    assert_eq!(cfg.yolo11.detector.confidence, 0.35);
    assert_eq!(cfg.yolo11.detector.iou, 0.6);
    assert_eq!(cfg.rt_detr.path, PathBuf::from("/srv/rtdetr.onnx"));
    assert_eq!(cfg.rt_detr.labels, Some(PathBuf::from("weights/labels.txt")));
    assert_eq!(cfg.rt_detr.detector.input_size, 512);
    assert_eq!(
        cfg.enabled_models(),
        vec![BackendKind::Grid, BackendKind::Transformer]
    );

    clear_env();
}

#[test]
fn loads_json_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".json",
        r#"{
            "addr": "127.0.0.1:0",
            "models": {
                "faster-rcnn": { "score_threshold": 0.7, "min_size": 600, "max_size": 1000 }
            }
        }"#,
    );
    let cfg = ServiceConfig::load_from(Some(file.path())).expect("load json");
    assert_eq!(cfg.addr, "127.0.0.1:0");
    assert_eq!(cfg.faster_rcnn.detector.score_threshold, 0.7);
    assert_eq!(cfg.faster_rcnn.detector.min_size, 600);
    assert_eq!(cfg.faster_rcnn.detector.max_size, 1000);
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        r#"{ "crop_quality": 0 }"#,
        r#"{ "default_model": "unknown-model" }"#,
        r#"{ "models": { "yolo11": { "confidence": 1.5 } } }"#,
        r#"{ "models": { "rt-detr": { "input_size": 0 } } }"#,
        r#"{ "models": { "yolo11": { "input_size": 40000 } } }"#,
        r#"{ "models": { "faster-rcnn": { "max_size": 100000 } } }"#,
        r#"{ "max_connections": 0 }"#,
        r#"{ "models": { "faster-rcnn": { "min_size": 1400 } } }"#,
        r#"{ "models": { "yolo11": { "enabled": false } } }"#,
        r#"{ "models": {
                "yolo11": { "enabled": false },
                "rt-detr": { "enabled": false },
                "faster-rcnn": { "enabled": false } } }"#,
    ];
    for case in cases {
        let file = temp_config(".json", case);
        assert!(
            ServiceConfig::load_from(Some(file.path())).is_err(),
            "accepted {}",
            case
        );
    }

    std::env::set_var("VISION_MAX_REQUEST_BYTES", "lots");
    assert!(ServiceConfig::load().is_err());
    clear_env();
}

#[test]
fn unreadable_or_malformed_files_fail() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let missing = PathBuf::from("/nonexistent/vision.toml");
    assert!(ServiceConfig::load_from(Some(&missing)).is_err());

    let file = temp_config(".toml", "addr = [");
    assert!(ServiceConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn missing_model_weights_abort_registry_build() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("tempdir");
    std::env::set_var("VISION_YOLO11_MODEL", dir.path().join("absent.onnx"));
    let cfg = ServiceConfig::load().expect("load config");
    let err = cfg
        .build_registry()
        .err()
        .expect("missing weights must fail");
    assert!(format!("{:#}", err).contains("absent.onnx"));

    clear_env();
}
