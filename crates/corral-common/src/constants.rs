//! System-wide constants and default paths.

/// Default directory holding one subdirectory per container.
pub const DEFAULT_CONTAINERS_DIR: &str = "/var/lib/corral/containers";

/// Default cgroup v1 mount root, one subdirectory per controller.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent cgroup under which every container cgroup is created.
pub const DEFAULT_CGROUP_PARENT: &str = "corral";

/// Default host path of the stage3 init binary.
pub const DEFAULT_INIT_BINARY: &str = "/usr/libexec/corral/corral-init";

/// Resource controllers a cgroup must exist in.
pub const CGROUP_CONTROLLERS: [&str; 5] = ["cpu", "cpuacct", "devices", "memory", "blkio"];

/// Environment variable that switches the binary into namespace spawner mode.
pub const SPAWNER_SENTINEL: &str = "CORRAL_SPAWNER_INTERCEPT";

/// Environment variable carrying the stage3 socket path.
pub const INIT_SOCKET_ENV: &str = "CORRAL_INIT_SOCKET";

/// Directory inside the container root holding corral's own files.
pub const CONTAINER_STATE_DIR: &str = "/.corral";

/// Path of the stage3 binary inside the container.
pub const CONTAINER_INIT_PATH: &str = "/.corral/init";

/// Path of the stage3 control socket inside the container.
pub const CONTAINER_INIT_SOCKET: &str = "/.corral/init.sock";

/// File inside the container the application's stdout and stderr are
/// appended to.
pub const CONTAINER_APP_LOG: &str = "/.corral/app.log";

/// File name of the image manifest inside a container directory.
pub const MANIFEST_FILE: &str = "manifest";

/// File name of the runtime manifest inside a container directory.
pub const RUNTIME_MANIFEST_FILE: &str = "container";

/// File name of the spawner log inside a container directory.
pub const STAGE2_LOG_FILE: &str = "stage2.log";

/// Name of the root filesystem directory inside a container directory.
pub const ROOTFS_DIR: &str = "rootfs";

/// Name under which the container's application is started in stage3.
pub const APP_PROCESS_NAME: &str = "app";

/// Default `PATH` given to container applications.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Application name used in CLI output.
pub const APP_NAME: &str = "corral";
