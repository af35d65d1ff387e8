use std::env;

fn main() {
	let out_dir = env::var("OUT_DIR").unwrap();
	// OUT_DIR looks like target/<profile>/build/<pkg>/out; walk back to the profile.
	let profile_name = out_dir
		.split(std::path::MAIN_SEPARATOR)
		.nth_back(3)
		.unwrap();
	println!(
		"cargo:rustc-env=GANGWAY_BUILD_RUSTC_VERSION={}",
		rustc_version::version().unwrap()
	);
	println!("cargo:rustc-env=GANGWAY_BUILD_PROFILE_NAME={profile_name}");
}
