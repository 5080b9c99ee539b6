use std::env;
use std::path::PathBuf;

fn main() {
    // Only run bindgen and linking logic if the `spinnaker-sdk` feature is enabled.
    // This allows the crate to compile without the SDK if the feature is not active.
    #[cfg(feature = "spinnaker-sdk")]
    {
        println!("cargo:rerun-if-env-changed=SPINNAKER_SDK_DIR");
        println!("cargo:rerun-if-env-changed=SPINNAKER_LIB_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let sdk_dir = env::var("SPINNAKER_SDK_DIR").expect(
            "SPINNAKER_SDK_DIR environment variable must be set when `spinnaker-sdk` feature is enabled.",
        );

        // The C API headers live in include/spinc on every platform the SDK ships for
        let sdk_include_path = PathBuf::from(&sdk_dir).join("include");
        let spinc_include_path = sdk_include_path.join("spinc");

        let sdk_lib_path = if let Ok(lib_dir) = env::var("SPINNAKER_LIB_DIR") {
            PathBuf::from(lib_dir)
        } else {
            PathBuf::from(&sdk_dir).join("lib")
        };

        if !spinc_include_path.exists() {
            panic!(
                "Spinnaker C include path does not exist: {:?}",
                spinc_include_path
            );
        }
        if !sdk_lib_path.exists() {
            eprintln!(
                "Warning: Spinnaker SDK lib path does not exist: {:?}",
                sdk_lib_path
            );
        }

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk_include_path.display()))
            .clang_arg(format!("-I{}", spinc_include_path.display()))
            // System, camera list, camera, image and node-map entry points
            .allowlist_function("spin.*")
            .allowlist_type("spin.*")
            .allowlist_type("_spin.*")
            .allowlist_type("bool8_t")
            .allowlist_var("SPINNAKER_.*")
            .allowlist_var("EVENT_TIMEOUT_.*")
            // Status codes and image status stay plain integer constants so
            // the driver layer can compare them against its own status table.
            .default_enum_style(bindgen::EnumVariation::Consts)
            .generate()
            .expect("Unable to generate bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", sdk_lib_path.display());

        #[cfg(target_os = "windows")]
        {
            println!("cargo:rustc-link-lib=SpinnakerC_v140");
        }
        #[cfg(not(target_os = "windows"))]
        {
            println!("cargo:rustc-link-lib=SpinnakerC");
        }
    }
    #[cfg(not(feature = "spinnaker-sdk"))]
    {
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when spinnaker-sdk feature is not enabled\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}
