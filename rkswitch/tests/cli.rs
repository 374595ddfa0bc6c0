use std::path::Path;
use std::process::{Command, Output};

struct Roots {
    _tmp: tempfile::TempDir,
    products: String,
    storage: String,
}

impl Roots {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let products = tmp.path().join("products");
        let storage = tmp.path().join("storage");
        std::fs::create_dir_all(products.join("app")).unwrap();
        std::fs::create_dir_all(&storage).unwrap();
        Self {
            products: products.to_str().unwrap().to_owned(),
            storage: storage.to_str().unwrap().to_owned(),
            _tmp: tmp,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_rkswitch"))
            .args(args)
            .env("SWITCH_PRODUCTS_ROOT", &self.products)
            .env("SWITCH_STORAGE_ROOT", &self.storage)
            .env("SWITCH_PRIVILEGE", "sudo")
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn missing_roots_are_reported() {
    let output = Command::new(env!("CARGO_BIN_EXE_rkswitch"))
        .args(["which", "app"])
        .env_remove("SWITCH_PRODUCTS_ROOT")
        .env_remove("SWITCH_STORAGE_ROOT")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).starts_with("Error: "), "{}", stderr(&output));
    assert!(stderr(&output).contains("SWITCH_PRODUCTS_ROOT"));
}

#[test]
fn create_derive_and_list() {
    let roots = Roots::new();
    assert!(roots.run(&["create", "app", "v1"]).status.success());
    assert!(roots.run(&["derive", "app", "v2", "v1"]).status.success());
    assert!(Path::new(&roots.storage).join("app/v2/lower").is_dir());

    let output = roots.run(&["list", "app", "--json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed[0]["name"], "v1");
    assert_eq!(listed[1]["name"], "v2");
    assert_eq!(listed[1]["parent"], "v1");
    assert_eq!(listed[1]["selected"], false);

    let output = roots.run(&["which", "app"]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn refusals_exit_with_status_one() {
    let roots = Roots::new();
    roots.run(&["create", "app", "v1"]);
    roots.run(&["derive", "app", "v2", "v1"]);

    let output = roots.run(&["delete", "app", "v1"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stderr(&output).trim_end(), "Error: version v1 is parent, detach first");

    let output = roots.run(&["create", "app", "v1"]);
    assert_eq!(stderr(&output).trim_end(), "Error: version v1 already exists");

    let output = roots.run(&["unselect", "app"]);
    assert_eq!(output.status.code(), Some(1));

    let output = roots.run(&["create", "missing", "v1"]);
    assert_eq!(stderr(&output).trim_end(), "Error: product missing not found");
}

#[test]
fn flags_override_environment() {
    let roots = Roots::new();
    let output = Command::new(env!("CARGO_BIN_EXE_rkswitch"))
        .args([
            "create",
            "app",
            "v1",
            "--products-root",
            &roots.products,
            "--storage-root",
            &roots.storage,
        ])
        .env("SWITCH_PRODUCTS_ROOT", "/nonexistent/products")
        .env("SWITCH_STORAGE_ROOT", "/nonexistent/storage")
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", stderr(&output));
    assert!(Path::new(&roots.storage).join("app/v1/upper").is_dir());
}
