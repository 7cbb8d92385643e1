use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=UCX_DIR");

    let prefix = find_ucx_prefix();

    println!("cargo:rustc-link-lib=ucp");
    println!("cargo:rustc-link-lib=ucs");
    println!("cargo:rustc-link-lib=uct");

    // RMA, AMO and request management only.
    let mut builder = bindgen::Builder::default()
        .header_contents("wrapper.h", "#include <ucp/api/ucp.h>\n")
        .allowlist_function("ucp_(init_version|cleanup|config_read|config_release)")
        .allowlist_function("ucp_worker_.*")
        .allowlist_function("ucp_mem_(map|unmap)")
        .allowlist_function("ucp_rkey_.*")
        .allowlist_function("ucp_ep_(create|close_nbx|rkey_unpack|destroy)")
        .allowlist_function("ucp_(put|get|atomic_op)_nbx")
        .allowlist_function("ucp_request_(free|check_status)")
        .allowlist_function("ucs_status_string")
        .allowlist_type("ucp_.*")
        .allowlist_type("ucs_.*")
        .allowlist_var("UCP_.*")
        .allowlist_var("UCS_.*");

    if let Some(prefix) = &prefix {
        let include = prefix.join("include");
        builder = builder.clang_arg(format!("-I{}", include.display()));
        println!(
            "cargo:rustc-link-search=native={}",
            prefix.join("lib").display()
        );
    }

    let bindings = builder
        .generate()
        .expect("Unable to generate UCX bindings. Is libucx-dev installed?");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}

/// Locate the UCX install prefix (the directory holding `include/ucp`).
fn find_ucx_prefix() -> Option<PathBuf> {
    if let Ok(dir) = env::var("UCX_DIR") {
        let prefix = PathBuf::from(dir);
        if has_ucp_header(&prefix) {
            return Some(prefix);
        }
    }

    let candidates = ["/usr", "/usr/local", "/opt/ucx"];
    for path in &candidates {
        let prefix = PathBuf::from(path);
        if has_ucp_header(&prefix) {
            return Some(prefix);
        }
    }

    if let Ok(output) = std::process::Command::new("pkg-config")
        .args(["--cflags", "ucx"])
        .output()
        && output.status.success()
    {
        let flags = String::from_utf8_lossy(&output.stdout);
        for flag in flags.split_whitespace() {
            if let Some(include) = flag.strip_prefix("-I") {
                return PathBuf::from(include).parent().map(PathBuf::from);
            }
        }
    }

    None
}

fn has_ucp_header(prefix: &std::path::Path) -> bool {
    prefix.join("include/ucp/api/ucp.h").exists()
}
